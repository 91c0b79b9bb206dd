//! Extract nodes: the single row source of a step.

use super::{ComputationalNode, Dependency, NodeSpec};
use crate::core::{NodeKind, NodeOutput, Row};
use crate::errors::{EtlError, ValidationError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A resource-owning row source.
///
/// `extract` is called at most once per step run and yields a finite,
/// non-restartable stream. `teardown` is called on every exit path, including
/// a failed `setup`, so it must tolerate partially acquired resources.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Acquires resources.
    async fn setup(&self) -> Result<(), EtlError> {
        Ok(())
    }

    /// Returns the row stream.
    async fn extract(&self) -> Result<BoxStream<'static, Result<NodeOutput, EtlError>>, EtlError>;

    /// Releases resources.
    async fn teardown(&self) -> Result<(), EtlError> {
        Ok(())
    }

    /// Returns the number of rows `extract` will yield, if known.
    async fn length(&self) -> Result<Option<u64>, EtlError> {
        Ok(None)
    }

    /// Definition text that feeds the node identity.
    fn definition(&self) -> String;

    /// The query as sent to the source, recorded on the step run.
    fn rendered_query(&self) -> Option<String> {
        None
    }
}

type RowFactory = dyn Fn() -> Box<dyn Iterator<Item = NodeOutput> + Send> + Send + Sync;

/// An extractor over an in-process iterator.
///
/// The factory is called once per `extract`, so the same node can be run in
/// several step runs.
pub struct IterExtract {
    label: String,
    factory: Arc<RowFactory>,
    length: Option<u64>,
}

impl IterExtract {
    /// Creates an extractor from an iterator factory.
    pub fn new<F, I>(label: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = NodeOutput>,
        I::IntoIter: Send + 'static,
    {
        Self {
            label: label.into(),
            factory: Arc::new(move || -> Box<dyn Iterator<Item = NodeOutput> + Send> {
                Box::new(factory().into_iter())
            }),
            length: None,
        }
    }

    /// Creates an extractor over a fixed set of rows; the length is known.
    #[must_use]
    pub fn from_rows(label: impl Into<String>, rows: Vec<NodeOutput>) -> Self {
        let length = rows.len() as u64;
        Self::new(label, move || rows.clone()).with_length(length)
    }

    /// Declares the number of rows the iterator yields.
    #[must_use]
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }
}

impl fmt::Debug for IterExtract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterExtract")
            .field("label", &self.label)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Extractor for IterExtract {
    async fn extract(&self) -> Result<BoxStream<'static, Result<NodeOutput, EtlError>>, EtlError> {
        Ok(stream::iter((self.factory)().map(Ok)).boxed())
    }

    async fn length(&self) -> Result<Option<u64>, EtlError> {
        Ok(self.length)
    }

    fn definition(&self) -> String {
        self.label.clone()
    }
}

/// The extract node of a step.
#[derive(Clone)]
pub struct ExtractNode {
    spec: NodeSpec,
    extractor: Arc<dyn Extractor>,
}

impl ExtractNode {
    /// Starts building an extract node.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExtractNodeBuilder {
        ExtractNodeBuilder {
            name: name.into(),
            outputs: Vec::new(),
            version: None,
            dependency: Dependency::new(),
        }
    }

    /// Returns the extractor.
    #[must_use]
    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    /// Resolves one yielded value against the declared outputs.
    ///
    /// # Errors
    ///
    /// Returns an [`EtlError::Arity`] when the shape does not match.
    pub fn resolve_row(&self, output: NodeOutput) -> Result<Row, EtlError> {
        Ok(output.resolve(&self.spec.name, &self.spec.outputs)?)
    }
}

impl ComputationalNode for ExtractNode {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }
}

impl fmt::Debug for ExtractNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractNode")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExtractNode`].
#[derive(Debug, Clone)]
pub struct ExtractNodeBuilder {
    name: String,
    outputs: Vec<String>,
    version: Option<String>,
    dependency: Dependency,
}

impl ExtractNodeBuilder {
    /// Sets the ordered output names.
    #[must_use]
    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the node version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Declares what the extract reads.
    #[must_use]
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    /// Builds the node around an extractor.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for missing or duplicate outputs.
    pub fn build(self, extractor: impl Extractor + 'static) -> Result<ExtractNode, ValidationError> {
        self.build_shared(Arc::new(extractor))
    }

    /// Builds the node around a shared extractor.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for missing or duplicate outputs.
    pub fn build_shared(self, extractor: Arc<dyn Extractor>) -> Result<ExtractNode, ValidationError> {
        if self.outputs.is_empty() {
            return Err(ValidationError::new(format!(
                "Extract '{}' must declare at least one output",
                self.name
            ))
            .with_nodes(vec![self.name]));
        }
        let spec = NodeSpec::new(
            NodeKind::Extract,
            self.name,
            self.version,
            extractor.definition(),
            BTreeMap::new(),
            self.outputs,
            self.dependency,
        )?;
        Ok(ExtractNode { spec, extractor })
    }
}
