//! An ephemeral database: the same base/state surface as the filesystem
//! database, with nothing persisted. Changes mutate the state and vanish with
//! the value.

use std::sync::{RwLock, RwLockReadGuard};

use crate::model::{Factory, ModelError, State};

pub struct Database<F: Factory> {
    base: F::Base,
    state: RwLock<F::State>,
}

impl<F: Factory> Database<F> {
    pub fn new(factory: &F) -> Self {
        let base = factory.new_base();
        let state = factory.new_state(&base);
        Self {
            base,
            state: RwLock::new(state),
        }
    }

    pub fn base(&self) -> &F::Base {
        &self.base
    }

    pub fn state(&self) -> RwLockReadGuard<'_, F::State> {
        self.state.read().expect("state lock poisoned")
    }

    pub fn apply(&self, change: &F::Change) -> Result<(), ModelError> {
        self.state
            .write()
            .expect("state lock poisoned")
            .apply(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CounterFactory, TestChange};

    #[test]
    fn apply_mutates_the_state() {
        let db = Database::new(&CounterFactory);

        db.apply(&TestChange::inc(1)).unwrap();
        assert_eq!(db.state().counter, 1);

        db.apply(&TestChange::inc(20)).unwrap();
        assert_eq!(db.state().counter, 21);
        assert_eq!(db.base().value, 0);
    }

    #[test]
    fn failed_apply_surfaces_the_error() {
        let db = Database::new(&CounterFactory);
        db.apply(&TestChange::inc(i64::MAX)).unwrap();

        assert!(db.apply(&TestChange::inc(1)).is_err());
        assert_eq!(db.state().counter, i64::MAX);
    }
}
