use std::fmt;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The CISC instruction set. `Incr`..`Halt` are produced by the lifter;
/// `Push`..`Restore` only appear in Brainforth images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Incr,
    Decr,
    Add,
    AddOffset,
    XfrMultiple,
    SetZero,
    Left,
    Right,
    Move,
    SeekLeft,
    SeekRight,
    Open,
    Close,
    Get,
    Put,
    Push,
    Pop,
    Call,
    Return,
    Save,
    Restore,
    Halt,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Incr => "INCR",
            OpCode::Decr => "DECR",
            OpCode::Add => "ADD",
            OpCode::AddOffset => "ADD_OFFSET",
            OpCode::XfrMultiple => "XFR_MULTIPLE",
            OpCode::SetZero => "SET_ZERO",
            OpCode::Left => "LEFT",
            OpCode::Right => "RIGHT",
            OpCode::Move => "MOVE",
            OpCode::SeekLeft => "SEEK_LEFT",
            OpCode::SeekRight => "SEEK_RIGHT",
            OpCode::Open => "OPEN",
            OpCode::Close => "CLOSE",
            OpCode::Get => "GET",
            OpCode::Put => "PUT",
            OpCode::Push => "PUSH",
            OpCode::Pop => "POP",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Save => "SAVE",
            OpCode::Restore => "RESTORE",
            OpCode::Halt => "HALT",
        }
    }
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "INCR" => Some(OpCode::Incr),
            "DECR" => Some(OpCode::Decr),
            "ADD" => Some(OpCode::Add),
            "ADD_OFFSET" => Some(OpCode::AddOffset),
            "XFR_MULTIPLE" => Some(OpCode::XfrMultiple),
            "SET_ZERO" => Some(OpCode::SetZero),
            "LEFT" => Some(OpCode::Left),
            "RIGHT" => Some(OpCode::Right),
            "MOVE" => Some(OpCode::Move),
            "SEEK_LEFT" => Some(OpCode::SeekLeft),
            "SEEK_RIGHT" => Some(OpCode::SeekRight),
            "OPEN" => Some(OpCode::Open),
            "CLOSE" => Some(OpCode::Close),
            "GET" => Some(OpCode::Get),
            "PUT" => Some(OpCode::Put),
            "PUSH" => Some(OpCode::Push),
            "POP" => Some(OpCode::Pop),
            "CALL" => Some(OpCode::Call),
            "RETURN" => Some(OpCode::Return),
            "SAVE" => Some(OpCode::Save),
            "RESTORE" => Some(OpCode::Restore),
            "HALT" => Some(OpCode::Halt),
            _ => None,
        }
    }
    /// Number of operand slots following the opcode slot in the stream.
    pub fn operand_slots(self) -> usize {
        match self {
            OpCode::Add
            | OpCode::AddOffset
            | OpCode::XfrMultiple
            | OpCode::Move
            | OpCode::Open
            | OpCode::Close
            | OpCode::Call => 1,
            _ => 0,
        }
    }
    pub(crate) fn takes_dyad(self) -> bool {
        matches!(self, OpCode::AddOffset | OpCode::XfrMultiple)
    }
    /// Whether the current cell is provably zero once this opcode has run.
    pub(crate) fn zeroes_loc(self) -> bool {
        matches!(
            self,
            OpCode::SetZero | OpCode::SeekLeft | OpCode::SeekRight | OpCode::Close | OpCode::Save
        )
    }
    /// True for instructions whose effect is wiped out by a following
    /// `SET_ZERO` on the same cell.
    pub(crate) fn discard_before_set_zero(self) -> bool {
        matches!(self, OpCode::Incr | OpCode::Decr | OpCode::Add)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One slot of the instruction stream. The dispatch loop relies on the
/// planter having laid operands directly after their opcode; it never
/// re-discovers the layout by inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Op(OpCode),
    Operand(i64),
    Dyad(i32, i32),
    /// Unresolved procedure reference, replaced by an `Operand` when an
    /// image is loaded.
    Ref(String),
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Record::Op(op) => {
                let hint = op.discard_before_set_zero();
                let mut map = serializer.serialize_map(Some(1 + hint as usize))?;
                map.serialize_entry("OpCode", op.name())?;
                if hint {
                    map.serialize_entry("DiscardBeforeSetZero", &true)?;
                }
                map.end()
            }
            Record::Operand(n) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Operand", n)?;
                map.end()
            }
            Record::Dyad(high, low) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("High", high)?;
                map.serialize_entry("Low", low)?;
                map.end()
            }
            Record::Ref(name) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Ref", name)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an instruction record object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Record, A::Error> {
                let mut op_code: Option<String> = None;
                let mut operand: Option<i64> = None;
                let mut high: Option<i32> = None;
                let mut low: Option<i32> = None;
                let mut reference: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "OpCode" => op_code = Some(map.next_value()?),
                        "Operand" => operand = Some(map.next_value()?),
                        "High" => high = Some(map.next_value()?),
                        "Low" => low = Some(map.next_value()?),
                        "Ref" => reference = Some(map.next_value()?),
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                if let Some(name) = op_code {
                    let op = OpCode::from_name(&name)
                        .ok_or_else(|| de::Error::custom(format!("unrecognised opcode: {name}")))?;
                    Ok(Record::Op(op))
                } else if let Some(n) = operand {
                    Ok(Record::Operand(n))
                } else if let (Some(high), Some(low)) = (high, low) {
                    Ok(Record::Dyad(high, low))
                } else if let Some(name) = reference {
                    Ok(Record::Ref(name))
                } else {
                    Err(de::Error::custom(
                        "record carries none of OpCode, Operand, High/Low or Ref",
                    ))
                }
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

/// Append-only instruction stream with the one exception the lifter needs:
/// overwriting a forward branch target once its `]` is reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program(Vec<Record>);

impl Program {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn push(&mut self, record: Record) {
        self.0.push(record);
    }
    pub fn get(&self, slot: usize) -> Option<&Record> {
        self.0.get(slot)
    }
    pub fn records(&self) -> &[Record] {
        &self.0
    }
    pub fn into_records(self) -> Vec<Record> {
        self.0
    }
    pub(crate) fn set(&mut self, slot: usize, record: Record) {
        self.0[slot] = record;
    }
    pub(crate) fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl From<Vec<Record>> for Program {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}
