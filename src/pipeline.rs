//! An ordered list of named processing stages.
//!
//! Every [`Connection`](crate::Connection) owns a pipeline. Outbound
//! [`WireMessage`]s pass through each stage in order before reaching the
//! transport; stages may transform, expand or swallow messages. Stages are
//! addressed by name so collaborators can insert relative to one another
//! without baking in positional knowledge.

use std::fmt;
use std::io;

use crate::message::WireMessage;
use crate::{Error, Result};

/// Name of the stage that slices chunked inputs (e.g. file regions) into
/// transport-sized chunks.
pub const CHUNKED_WRITER: &str = "chunked-writer";

/// Name of the stage that bridges the pipeline to the reactive contract of
/// the exchange driving the connection.
pub const BRIDGE: &str = "bridge";

/// A single processing stage.
pub trait Stage: Send {
    /// Process one outbound message, producing any number of messages to
    /// hand to the next stage.
    fn process(&mut self, msg: WireMessage) -> io::Result<Vec<WireMessage>>;
}

/// The terminal pass-through stage installed where the pipeline hands off
/// to the exchange.
#[derive(Debug, Default)]
pub struct BridgeStage;

impl BridgeStage {
    /// Create a new bridge stage.
    pub fn new() -> Self {
        BridgeStage
    }
}

impl Stage for BridgeStage {
    fn process(&mut self, msg: WireMessage) -> io::Result<Vec<WireMessage>> {
        Ok(vec![msg])
    }
}

/// An ordered collection of named stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<(String, Box<dyn Stage>)>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Pipeline { stages: vec![] }
    }

    /// Returns `true` if a stage with the given name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|(n, _)| n == name)
    }

    /// The number of stages currently installed.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if no stages are installed.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The stage names, first to last.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(n, _)| n.as_str())
    }

    /// Append a stage at the end of the pipeline.
    pub fn add_last(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        self.check_free(name)?;
        self.stages.push((name.to_owned(), stage));
        Ok(())
    }

    /// Insert a stage immediately before the named anchor stage.
    pub fn add_before(&mut self, anchor: &str, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        self.check_free(name)?;
        let idx = self.position(anchor)?;
        self.stages.insert(idx, (name.to_owned(), stage));
        Ok(())
    }

    /// Insert a stage immediately after the named anchor stage.
    pub fn add_after(&mut self, anchor: &str, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        self.check_free(name)?;
        let idx = self.position(anchor)?;
        self.stages.insert(idx + 1, (name.to_owned(), stage));
        Ok(())
    }

    /// Remove and return the named stage.
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Stage>> {
        let idx = self.position(name)?;
        Ok(self.stages.remove(idx).1)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(Error::State("no such stage in pipeline"))
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(Error::State("duplicate stage name in pipeline"));
        }
        Ok(())
    }

    /// Run a message through every stage in order.
    pub(crate) fn run(&mut self, msg: WireMessage) -> io::Result<Vec<WireMessage>> {
        let mut current = vec![msg];
        for (_, stage) in self.stages.iter_mut() {
            let mut next = Vec::with_capacity(current.len());
            for msg in current {
                next.extend(stage.process(msg)?);
            }
            current = next;
        }
        Ok(current)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Box<dyn Stage> {
        Box::new(BridgeStage::new())
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", noop()).unwrap();
        pipeline.add_last("c", noop()).unwrap();
        pipeline.add_before("c", "b", noop()).unwrap();
        pipeline.add_after("c", "d", noop()).unwrap();
        let names: Vec<_> = pipeline.names().collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", noop()).unwrap();
        assert!(pipeline.add_last("a", noop()).is_err());
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn missing_anchor_is_an_error() {
        let mut pipeline = Pipeline::new();
        assert!(pipeline.add_before("nope", "a", noop()).is_err());
        assert!(pipeline.remove("nope").is_err());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn remove_returns_the_stage() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("a", noop()).unwrap();
        pipeline.remove("a").unwrap();
        assert!(!pipeline.contains("a"));
    }
}
