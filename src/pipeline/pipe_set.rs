//! The input or output pipes attached to one filter.
//!
//! Pipes are registered either by name (bound to a named computation slot) or by
//! type (matched against an unnamed slot of the same type). Every pipe is reachable
//! by name; only typed registrations are reachable by type.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::pipe::Pipe;
use crate::pipeline::value::DataType;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PipeSet {
    owner: String,
    pipes: Vec<Pipe>,
    named: HashMap<String, usize>,
    typed: HashMap<DataType, usize>,
    lengths: HashMap<String, Pipe>,
}

impl PipeSet {
    /// `owner` names the filter (and side) in registration errors.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Register a pipe to be matched by name.
    pub fn register_named(&mut self, pipe: &Pipe) -> PipelineResult<()> {
        self.check_name(pipe)?;
        self.push(pipe);
        Ok(())
    }

    /// Register a pipe to be matched by its type. At most one pipe per type.
    pub fn register_typed(&mut self, pipe: &Pipe) -> PipelineResult<()> {
        self.check_name(pipe)?;
        if self.typed.contains_key(pipe.data_type()) {
            return Err(PipelineError::AlreadyRegistered {
                owner: self.owner.clone(),
                what: format!("a pipe of type '{}'", pipe.data_type()),
            });
        }
        let index = self.push(pipe);
        self.typed.insert(pipe.data_type().clone(), index);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<&Pipe> {
        self.named.get(name).map(|&i| &self.pipes[i])
    }

    pub fn by_type(&self, ty: &DataType) -> Option<&Pipe> {
        self.typed.get(ty).map(|&i| &self.pipes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// Pair the registered pipe `streamed` with the pipe carrying its lengths.
    pub fn set_length(&mut self, streamed: &str, source: &Pipe) -> PipelineResult<()> {
        if !self.contains(streamed) {
            return Err(PipelineError::PipeNotFound {
                filter: self.owner.clone(),
                slot: format!("length association of '{streamed}'"),
            });
        }
        if self.lengths.contains_key(streamed) {
            return Err(PipelineError::AlreadyRegistered {
                owner: self.owner.clone(),
                what: format!("length source of '{streamed}'"),
            });
        }
        self.lengths.insert(streamed.to_string(), source.clone());
        Ok(())
    }

    pub fn length_for(&self, streamed: &str) -> Option<&Pipe> {
        self.lengths.get(streamed)
    }

    /// (streamed pipe name, length source) pairs.
    pub fn lengths(&self) -> impl Iterator<Item = (&str, &Pipe)> {
        self.lengths.iter().map(|(name, pipe)| (name.as_str(), pipe))
    }

    /// Pipes in registration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Pipe> {
        self.pipes.iter()
    }

    /// Visit every pipe, stopping at the first error.
    pub fn try_for_each<E>(&self, f: impl FnMut(&Pipe) -> Result<(), E>) -> Result<(), E> {
        self.pipes.iter().try_for_each(f)
    }

    pub fn all_open(&self) -> bool {
        self.pipes.iter().all(Pipe::is_open)
    }

    pub fn close_all(&self) {
        self.pipes.iter().for_each(Pipe::close);
    }

    fn check_name(&self, pipe: &Pipe) -> PipelineResult<()> {
        if self.named.contains_key(pipe.name()) {
            return Err(PipelineError::AlreadyRegistered {
                owner: self.owner.clone(),
                what: format!("pipe '{}'", pipe.name()),
            });
        }
        Ok(())
    }

    fn push(&mut self, pipe: &Pipe) -> usize {
        let index = self.pipes.len();
        self.pipes.push(pipe.clone());
        self.named.insert(pipe.name().to_string(), index);
        index
    }
}

impl<'a> IntoIterator for &'a PipeSet {
    type Item = &'a Pipe;
    type IntoIter = std::slice::Iter<'a, Pipe>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_type() {
        let mut set = PipeSet::new("f inputs");
        let a = Pipe::of::<i32>("a", 1);
        let b = Pipe::of::<String>("b", 1);
        set.register_named(&a).unwrap();
        set.register_typed(&b).unwrap();

        assert_eq!(set.by_name("a"), Some(&a));
        assert_eq!(set.by_name("b"), Some(&b));
        assert_eq!(set.by_type(&DataType::of::<String>()), Some(&b));
        // Named registrations are not matched by type.
        assert!(set.by_type(&DataType::of::<i32>()).is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut set = PipeSet::new("f inputs");
        set.register_typed(&Pipe::of::<i32>("a", 1)).unwrap();
        assert!(set.register_named(&Pipe::of::<u8>("a", 1)).is_err());
        assert!(matches!(
            set.register_typed(&Pipe::of::<i32>("c", 1)),
            Err(PipelineError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_length_association() {
        let mut set = PipeSet::new("join inputs");
        let dupls = Pipe::of::<i64>("dupls", 1);
        let items = Pipe::of::<Vec<i64>>("items", 1);
        set.register_named(&dupls).unwrap();

        assert!(matches!(
            set.set_length("missing", &items),
            Err(PipelineError::PipeNotFound { .. })
        ));
        set.set_length("dupls", &items).unwrap();
        assert!(set.set_length("dupls", &items).is_err());
        assert_eq!(set.length_for("dupls"), Some(&items));
        assert_eq!(set.lengths().count(), 1);
    }

    #[test]
    fn test_short_circuit_and_close() {
        let mut set = PipeSet::new("f outputs");
        for name in ["x", "y", "z"] {
            set.register_named(&Pipe::of::<u8>(name, 1)).unwrap();
        }
        let mut visited = 0;
        let result = set.try_for_each(|pipe| {
            visited += 1;
            if pipe.name() == "y" {
                Err(pipe.name().to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("y".to_string()));
        assert_eq!(visited, 2);

        assert!(set.all_open());
        set.close_all();
        assert!(!set.all_open());
    }
}
