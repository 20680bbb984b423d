use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Error;
use crate::ir::{OpCode, Program, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Procedure {
    name: String,
    code: Vec<Record>,
}

/// A loaded, executable set of procedures. Loading is two-phase: every
/// procedure is materialised first so indices are stable, then each `Ref`
/// record is rewritten into the operand index of the procedure it names.
/// A flat instruction stream loads as a lone `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    procedures: Vec<Procedure>,
    main: usize,
}

impl Image {
    /// Wrap a freshly lifted program without revalidating it; the planter
    /// only emits well-formed streams.
    pub fn from_program(program: Program) -> Self {
        Self {
            procedures: vec![Procedure {
                name: "main".to_owned(),
                code: program.into_records(),
            }],
            main: 0,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(json)?;
        match value {
            value @ Value::Array(_) => {
                let mut code: Vec<Record> = serde_json::from_value(value)?;
                if code.last() != Some(&Record::Op(OpCode::Halt)) {
                    code.push(Record::Op(OpCode::Halt));
                }
                Self::from_bindings(BTreeMap::from([("main".to_owned(), code)]))
            }
            value @ Value::Object(_) => {
                let bindings: BTreeMap<String, Vec<Record>> = serde_json::from_value(value)?;
                Self::from_bindings(bindings)
            }
            _ => Err(Error::UnexpectedShape),
        }
    }

    /// Build and check an image from named record sequences, resolving
    /// procedure references as it goes.
    pub fn from_bindings(bindings: BTreeMap<String, Vec<Record>>) -> Result<Self, Error> {
        let procedures: Vec<Procedure> = bindings
            .into_iter()
            .map(|(name, code)| Procedure { name, code })
            .collect();
        let main = procedures
            .iter()
            .position(|p| p.name == "main")
            .ok_or(Error::MissingMain)?;
        let mut image = Self { procedures, main };
        image.resolve_refs()?;
        image.validate()?;
        Ok(image)
    }

    fn resolve_refs(&mut self) -> Result<(), Error> {
        let index: BTreeMap<String, usize> = self
            .procedures
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        for procedure in &mut self.procedures {
            for record in &mut procedure.code {
                if let Record::Ref(name) = record {
                    let target = index.get(name).ok_or_else(|| Error::DanglingRef {
                        enclosing: procedure.name.clone(),
                        name: name.clone(),
                    })?;
                    *record = Record::Operand(*target as i64);
                }
            }
        }
        Ok(())
    }

    /// Walk every procedure checking that operand slots sit where their
    /// opcode expects them, that CALL targets are real procedures, and
    /// that OPEN/CLOSE targets stay inside the procedure.
    fn validate(&self) -> Result<(), Error> {
        let count = self.procedures.len();
        for procedure in &self.procedures {
            let malformed = |slot| Error::Malformed {
                procedure: procedure.name.clone(),
                slot,
            };
            let mut slot = 0;
            while slot < procedure.code.len() {
                let Some(&Record::Op(op)) = procedure.code.get(slot) else {
                    return Err(malformed(slot));
                };
                slot += 1;
                for _ in 0..op.operand_slots() {
                    match (procedure.code.get(slot), op.takes_dyad()) {
                        (Some(Record::Dyad(_, _)), true) => {}
                        (Some(Record::Operand(target)), false) => {
                            let limit = match op {
                                OpCode::Call => Some(count),
                                OpCode::Open | OpCode::Close => Some(procedure.code.len()),
                                _ => None,
                            };
                            if let Some(limit) = limit {
                                if usize::try_from(*target).map_or(true, |t| t >= limit) {
                                    return Err(malformed(slot));
                                }
                            }
                        }
                        _ => return Err(malformed(slot)),
                    }
                    slot += 1;
                }
            }
        }
        Ok(())
    }

    pub fn main(&self) -> usize {
        self.main
    }
    pub(crate) fn procedure_count(&self) -> usize {
        self.procedures.len()
    }
    pub(crate) fn code(&self, procedure: usize) -> &[Record] {
        &self.procedures[procedure].code
    }
    pub(crate) fn name(&self, procedure: usize) -> &str {
        &self.procedures[procedure].name
    }
}
