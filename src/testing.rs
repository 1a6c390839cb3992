//! Counter model used by the unit and integration tests. Kept as a public
//! module so `tests/` can share it; it doubles as a reference implementation
//! of the model traits.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::model::{Base, Change, Factory, ModelError, ModelResult, State};

/// JSON base document: `{"value":N}` plus the payload ids it references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBase {
    #[serde(default)]
    pub value: i64,
    #[serde(
        rename = "payloadIDs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub payload_ids: Vec<String>,
}

impl Base for CounterBase {
    type Change = TestChange;

    fn read_from(&mut self, r: &mut dyn Read) -> ModelResult<u64> {
        let mut raw = Vec::new();
        let n = r.read_to_end(&mut raw)?;
        *self = serde_json::from_slice(&raw).map_err(|err| ModelError::Decode(err.into()))?;
        Ok(n as u64)
    }

    fn write_to(&self, w: &mut dyn Write) -> ModelResult<u64> {
        let mut raw = serde_json::to_vec(self).map_err(|err| ModelError::Encode(err.into()))?;
        raw.push(b'\n');
        w.write_all(&raw)?;
        Ok(raw.len() as u64)
    }

    fn apply(&mut self, change: &TestChange) -> ModelResult<()> {
        match change {
            TestChange::CounterInc(inc) => {
                self.value = self
                    .value
                    .checked_add(inc.value)
                    .ok_or_else(|| ModelError::Apply("counter overflow".into()))?;
            }
            TestChange::AttachPayload(attach) => {
                self.payload_ids.push(attach.payload_id.clone());
            }
        }
        Ok(())
    }

    fn payload_ids(&self) -> Vec<String> {
        self.payload_ids.clone()
    }
}

/// Live view: the base value folded with every applied increment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counter {
    pub counter: i64,
    pub payload_ids: Vec<String>,
}

impl State for Counter {
    type Change = TestChange;

    fn apply(&mut self, change: &TestChange) -> ModelResult<()> {
        match change {
            TestChange::CounterInc(inc) => {
                self.counter = self
                    .counter
                    .checked_add(inc.value)
                    .ok_or_else(|| ModelError::Apply("counter overflow".into()))?;
            }
            TestChange::AttachPayload(attach) => {
                self.payload_ids.push(attach.payload_id.clone());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterInc {
    pub value: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachPayload {
    #[serde(rename = "payloadID")]
    pub payload_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestChange {
    CounterInc(CounterInc),
    AttachPayload(AttachPayload),
}

impl TestChange {
    pub fn inc(value: i64) -> Self {
        TestChange::CounterInc(CounterInc { value })
    }

    pub fn attach(payload_id: impl Into<String>) -> Self {
        TestChange::AttachPayload(AttachPayload {
            payload_id: payload_id.into(),
        })
    }
}

impl Change for TestChange {
    fn type_name(&self) -> &str {
        match self {
            TestChange::CounterInc(_) => "counter-inc",
            TestChange::AttachPayload(_) => "attach-payload",
        }
    }

    fn read_from(&mut self, r: &mut dyn Read) -> ModelResult<u64> {
        let mut raw = Vec::new();
        let n = r.read_to_end(&mut raw)?;
        match self {
            TestChange::CounterInc(inc) => {
                *inc = serde_json::from_slice(&raw).map_err(|err| ModelError::Decode(err.into()))?;
            }
            TestChange::AttachPayload(attach) => {
                *attach =
                    serde_json::from_slice(&raw).map_err(|err| ModelError::Decode(err.into()))?;
            }
        }
        Ok(n as u64)
    }

    fn write_to(&self, w: &mut dyn Write) -> ModelResult<u64> {
        let mut raw = match self {
            TestChange::CounterInc(inc) => serde_json::to_vec(inc),
            TestChange::AttachPayload(attach) => serde_json::to_vec(attach),
        }
        .map_err(|err| ModelError::Encode(err.into()))?;
        raw.push(b'\n');
        w.write_all(&raw)?;
        Ok(raw.len() as u64)
    }

    fn payload_ids(&self) -> Vec<String> {
        match self {
            TestChange::CounterInc(_) => Vec::new(),
            TestChange::AttachPayload(attach) => vec![attach.payload_id.clone()],
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CounterFactory;

impl Factory for CounterFactory {
    type Base = CounterBase;
    type State = Counter;
    type Change = TestChange;

    fn new_base(&self) -> CounterBase {
        CounterBase::default()
    }

    fn new_state(&self, base: &CounterBase) -> Counter {
        Counter {
            counter: base.value,
            payload_ids: base.payload_ids.clone(),
        }
    }

    fn new_change(&self, type_name: &str) -> ModelResult<TestChange> {
        match type_name {
            "counter-inc" => Ok(TestChange::CounterInc(CounterInc::default())),
            "attach-payload" => Ok(TestChange::AttachPayload(AttachPayload::default())),
            other => Err(ModelError::UnknownType {
                type_name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_serializes_without_empty_payload_ids() {
        let base = CounterBase {
            value: 21,
            payload_ids: Vec::new(),
        };
        let mut out = Vec::new();
        base.write_to(&mut out).unwrap();
        assert_eq!(out, b"{\"value\":21}\n");
    }

    #[test]
    fn base_serializes_payload_ids_when_present() {
        let base = CounterBase {
            value: 1,
            payload_ids: vec!["456".to_string()],
        };
        let mut out = Vec::new();
        base.write_to(&mut out).unwrap();
        assert_eq!(out, b"{\"value\":1,\"payloadIDs\":[\"456\"]}\n");

        let mut parsed = CounterBase::default();
        parsed.read_from(&mut out.as_slice()).unwrap();
        assert_eq!(parsed, base);
    }

    #[test]
    fn change_bodies_match_the_wire_vectors() {
        let mut out = Vec::new();
        TestChange::inc(1).write_to(&mut out).unwrap();
        assert_eq!(out, b"{\"value\":1}\n");

        out.clear();
        TestChange::attach("123").write_to(&mut out).unwrap();
        assert_eq!(out, b"{\"payloadID\":\"123\"}\n");
    }

    #[test]
    fn factory_rejects_unknown_type() {
        let err = CounterFactory.new_change("no-such-type").unwrap_err();
        assert!(matches!(err, ModelError::UnknownType { .. }));
    }

    #[test]
    fn state_folds_base_value() {
        let factory = CounterFactory;
        let base = CounterBase {
            value: 3,
            payload_ids: vec!["a".to_string()],
        };
        let mut state = factory.new_state(&base);
        assert_eq!(state.counter, 3);

        state.apply(&TestChange::inc(4)).unwrap();
        assert_eq!(state.counter, 7);

        state.apply(&TestChange::attach("b")).unwrap();
        assert_eq!(state.payload_ids, ["a", "b"]);
    }
}
