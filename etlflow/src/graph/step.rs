//! Steps: one extract, ordered transforms and loads, validated and sorted.

use super::toposort::stable_toposort;
use super::{ComputationalNode, Dependency, ExtractNode, LoadNode, NodeSpec, TransformNode};
use crate::core::{NodeKind, Row};
use crate::errors::{ContractErrorInfo, ValidationError};
use crate::identity::{identity_hash_parts, short_hash};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

static STEP_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,127}$").ok());

/// Returns true for a valid step name.
#[must_use]
pub fn is_valid_step_name(name: &str) -> bool {
    STEP_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// A node of a step after the extract, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepNode {
    /// Index into [`EtlStep::transforms`].
    Transform(usize),
    /// Index into [`EtlStep::loads`].
    Load(usize),
}

/// Serializable summary of one node, persisted with the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Identity hash.
    pub identity: Uuid,
    /// User-supplied version.
    pub version: Option<String>,
    /// Definition text.
    pub definition: String,
    /// Input wiring by name.
    pub inputs: BTreeMap<String, Value>,
    /// Ordered outputs.
    pub outputs: Vec<String>,
}

impl From<&NodeSpec> for NodeDefinition {
    fn from(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            identity: spec.identity(),
            version: spec.version.clone(),
            definition: spec.definition.clone(),
            inputs: spec
                .inputs
                .iter()
                .map(|(name, input)| (name.clone(), input.wiring()))
                .collect(),
            outputs: spec.outputs.clone(),
        }
    }
}

/// Serializable summary of a step, persisted in the step metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Tags.
    pub tags: BTreeSet<String>,
    /// Step identity.
    pub identity: Uuid,
    /// Nodes in execution order, extract first.
    pub nodes: Vec<NodeDefinition>,
    /// Combined dependency.
    pub dependency: Dependency,
}

/// One extract, transform and load unit with its own node graph.
#[derive(Debug, Clone)]
pub struct EtlStep {
    name: String,
    description: Option<String>,
    tags: BTreeSet<String>,
    batch_size: Option<usize>,
    extract: Arc<ExtractNode>,
    transforms: Vec<Arc<TransformNode>>,
    loads: Vec<Arc<LoadNode>>,
    order: Vec<StepNode>,
    dependency: Dependency,
    identity: Uuid,
}

impl EtlStep {
    /// Starts building a step.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> EtlStepBuilder {
        EtlStepBuilder {
            name: name.into(),
            description: None,
            tags: BTreeSet::new(),
            batch_size: None,
            dependency: Dependency::new(),
            extract: None,
            transforms: Vec::new(),
            loads: Vec::new(),
        }
    }

    /// Returns the step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the tags.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns the batch-size override.
    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Returns the extract node.
    #[must_use]
    pub fn extract(&self) -> &Arc<ExtractNode> {
        &self.extract
    }

    /// Returns the transforms in declaration order.
    #[must_use]
    pub fn transforms(&self) -> &[Arc<TransformNode>] {
        &self.transforms
    }

    /// Returns the loads in declaration order.
    #[must_use]
    pub fn loads(&self) -> &[Arc<LoadNode>] {
        &self.loads
    }

    /// Returns the nodes after the extract in execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[StepNode] {
        &self.order
    }

    /// Returns load indices in execution order.
    pub fn load_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().filter_map(|node| match node {
            StepNode::Load(i) => Some(*i),
            StepNode::Transform(_) => None,
        })
    }

    /// Returns the union of all node dependencies and declared extras.
    #[must_use]
    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Returns the step identity.
    #[must_use]
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Returns true when the step carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Hashes one extracted row together with the step identity.
    #[must_use]
    pub fn input_hash(&self, row: &Row) -> Uuid {
        identity_hash_parts(&[json!(self.identity.to_string()), Value::Array(row.clone())])
    }

    /// Returns the node name behind a [`StepNode`].
    #[must_use]
    pub fn node_name(&self, node: StepNode) -> &str {
        match node {
            StepNode::Transform(i) => self.transforms[i].name(),
            StepNode::Load(i) => self.loads[i].name(),
        }
    }

    /// Returns the serializable summary of this step.
    #[must_use]
    pub fn definition(&self) -> StepDefinition {
        let mut nodes = vec![NodeDefinition::from(self.extract.spec())];
        nodes.extend(self.order.iter().map(|node| match node {
            StepNode::Transform(i) => NodeDefinition::from(self.transforms[*i].spec()),
            StepNode::Load(i) => NodeDefinition::from(self.loads[*i].spec()),
        }));
        StepDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            identity: self.identity,
            nodes,
            dependency: self.dependency.clone(),
        }
    }
}

/// Builder for [`EtlStep`].
#[derive(Debug, Clone)]
pub struct EtlStepBuilder {
    name: String,
    description: Option<String>,
    tags: BTreeSet<String>,
    batch_size: Option<usize>,
    dependency: Dependency,
    extract: Option<ExtractNode>,
    transforms: Vec<TransformNode>,
    loads: Vec<LoadNode>,
}

impl EtlStepBuilder {
    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Overrides the batch size for this step.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Declares extra needs or yields beyond those of the nodes.
    #[must_use]
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    /// Sets the extract node.
    #[must_use]
    pub fn extract(mut self, node: ExtractNode) -> Self {
        self.extract = Some(node);
        self
    }

    /// Appends a transform.
    #[must_use]
    pub fn transform(mut self, node: TransformNode) -> Self {
        self.transforms.push(node);
        self
    }

    /// Appends a load.
    #[must_use]
    pub fn load(mut self, node: LoadNode) -> Self {
        self.loads.push(node);
        self
    }

    /// Validates the wiring and sorts the nodes.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an invalid name, a missing
    /// extract, duplicate nodes, dangling or unknown references, or cycles.
    pub fn build(self) -> Result<EtlStep, ValidationError> {
        if !is_valid_step_name(&self.name) {
            return Err(ValidationError::new(format!("Invalid step name '{}'", self.name))
                .with_error_info(
                    ContractErrorInfo::new("STEP-001-NAME", "Invalid step name").with_fix_hint(
                        "Step names start with a letter and contain only letters, digits, '_' or '-'.",
                    ),
                ));
        }
        let extract = self.extract.ok_or_else(|| {
            ValidationError::new(format!("Step '{}' has no extract", self.name))
        })?;

        let specs: Vec<&NodeSpec> = std::iter::once(extract.spec())
            .chain(self.transforms.iter().map(ComputationalNode::spec))
            .chain(self.loads.iter().map(ComputationalNode::spec))
            .collect();

        let mut index: HashMap<Uuid, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if let Some(prev) = index.insert(spec.identity(), i) {
                return Err(ValidationError::new(format!(
                    "Nodes '{}' and '{}' of step '{}' are identical",
                    specs[prev].name, spec.name, self.name
                ))
                .with_nodes(vec![specs[prev].name.clone(), spec.name.clone()]));
            }
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let mut node_deps = Vec::new();
            for (input, arg) in spec.args() {
                let Some(&producer) = index.get(&arg.key) else {
                    return Err(ValidationError::new(format!(
                        "Input '{}' of node '{}' references output '{}' of node {}, which is not part of step '{}'",
                        input,
                        spec.name,
                        arg.name,
                        short_hash(&arg.key),
                        self.name
                    ))
                    .with_nodes(vec![spec.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new("GRAPH-001-MISSING_ARG", "Dangling argument")
                            .with_fix_hint("Did you add all transforms to the step?")
                            .with_context_entry("output", arg.name.clone()),
                    ));
                };
                if !specs[producer].outputs.contains(&arg.name) {
                    return Err(ValidationError::new(format!(
                        "Node '{}' has no output '{}' (wired into '{}' of node '{}')",
                        specs[producer].name, arg.name, input, spec.name
                    ))
                    .with_nodes(vec![spec.name.clone(), specs[producer].name.clone()]));
                }
                node_deps.push(producer);
            }
            deps.push(node_deps);
        }

        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let sorted = stable_toposort(&names, &deps)?;

        let n_transforms = self.transforms.len();
        let order: Vec<StepNode> = sorted
            .into_iter()
            .filter(|i| *i != 0)
            .map(|i| {
                if i <= n_transforms {
                    StepNode::Transform(i - 1)
                } else {
                    StepNode::Load(i - 1 - n_transforms)
                }
            })
            .collect();

        let dependency = Dependency::merge_all(specs.iter().map(|s| &s.dependency))
            .merge(&self.dependency);

        let mut parts = vec![json!(self.name)];
        parts.extend(specs.iter().map(|s| json!(s.identity().to_string())));
        let identity = identity_hash_parts(&parts);

        Ok(EtlStep {
            name: self.name,
            description: self.description,
            tags: self.tags,
            batch_size: self.batch_size,
            extract: Arc::new(extract),
            transforms: self.transforms.into_iter().map(Arc::new).collect(),
            loads: self.loads.into_iter().map(Arc::new).collect(),
            order,
            dependency,
            identity,
        })
    }
}
