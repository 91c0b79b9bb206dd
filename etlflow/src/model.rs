//! The owning registry of steps and load entities.

use crate::errors::{ContractErrorInfo, ValidationError};
use crate::graph::{EtlStep, LoadEntity};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A set of steps with unique names and the entities they write.
///
/// Entities are keyed by qualified table name. Two different definitions of
/// the same table are rejected.
#[derive(Debug, Clone, Default)]
pub struct EtlModel {
    steps: Vec<Arc<EtlStep>>,
    entities: BTreeMap<String, Arc<LoadEntity>>,
}

impl EtlModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step and registers the entities its loads write.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when a step with the same name exists
    /// or a load's entity conflicts with a registered one.
    pub fn add_step(&mut self, step: EtlStep) -> Result<Arc<EtlStep>, ValidationError> {
        if self.steps.iter().any(|s| s.name() == step.name()) {
            return Err(ValidationError::new(format!("Duplicate step name '{}'", step.name()))
                .with_nodes(vec![step.name().to_string()])
                .with_error_info(
                    ContractErrorInfo::new("STEP-002-DUPLICATE", "Duplicate step name")
                        .with_fix_hint("Step names must be unique within a model."),
                ));
        }
        for load in step.loads() {
            self.add_entity(Arc::clone(load.entity()))?;
        }
        let step = Arc::new(step);
        self.steps.push(Arc::clone(&step));
        Ok(step)
    }

    /// Builder-style [`EtlModel::add_step`].
    ///
    /// # Errors
    ///
    /// See [`EtlModel::add_step`].
    pub fn with_step(mut self, step: EtlStep) -> Result<Self, ValidationError> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Registers an entity. Registering an identical definition twice is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the table is already registered
    /// with a different definition.
    pub fn add_entity(&mut self, entity: Arc<LoadEntity>) -> Result<(), ValidationError> {
        let name = entity.qualified_name();
        match self.entities.get(&name) {
            Some(existing) if existing.as_ref() != entity.as_ref() => Err(ValidationError::new(format!(
                "Entity '{name}' is declared twice with different definitions"
            ))
            .with_nodes(vec![name])),
            Some(_) => Ok(()),
            None => {
                self.entities.insert(name, entity);
                Ok(())
            }
        }
    }

    /// Returns the steps in insertion order.
    #[must_use]
    pub fn steps(&self) -> &[Arc<EtlStep>] {
        &self.steps
    }

    /// Returns a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Arc<EtlStep>> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// Returns the registered entities by qualified name.
    #[must_use]
    pub fn entities(&self) -> &BTreeMap<String, Arc<LoadEntity>> {
        &self.entities
    }

    /// Returns an entity by qualified name.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Arc<LoadEntity>> {
        self.entities.get(name)
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true when the model has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeOutput;
    use crate::graph::{AttrType, ComputationalNode, ExtractNode, IterExtract, LoadNode};

    fn step(name: &str, entity: Arc<LoadEntity>) -> EtlStep {
        let extract = ExtractNode::builder(format!("{name}_source"))
            .outputs(["v"])
            .build(IterExtract::from_rows(name, vec![NodeOutput::scalar(1)]))
            .unwrap();
        let load = LoadNode::builder(format!("{name}_write"), entity)
            .input("v", extract.output("v").unwrap())
            .build()
            .unwrap();
        EtlStep::builder(name).extract(extract).load(load).build().unwrap()
    }

    fn entity(ty: AttrType) -> Arc<LoadEntity> {
        Arc::new(
            LoadEntity::builder("items")
                .identifying_attribute("v", ty)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_steps_register_entities() {
        let model = EtlModel::new()
            .with_step(step("a", entity(AttrType::Integer)))
            .unwrap()
            .with_step(step("b", entity(AttrType::Integer)))
            .unwrap();

        assert_eq!(model.len(), 2);
        assert!(model.step("b").is_some());
        assert_eq!(model.entities().len(), 1);
        assert!(model.entity("items").is_some());
    }

    #[test]
    fn test_duplicate_step_name_is_rejected() {
        let mut model = EtlModel::new();
        model.add_step(step("a", entity(AttrType::Integer))).unwrap();
        let err = model.add_step(step("a", entity(AttrType::Integer))).unwrap_err();
        assert_eq!(err.code(), Some("STEP-002-DUPLICATE"));
    }

    #[test]
    fn test_conflicting_entity_is_rejected() {
        let mut model = EtlModel::new();
        model.add_step(step("a", entity(AttrType::Integer))).unwrap();
        assert!(model.add_step(step("b", entity(AttrType::Text))).is_err());
        assert_eq!(model.len(), 1);
    }
}
