use std::io::{self, Read, Write};

use log::trace;
use thiserror::Error;

use crate::image::Image;
use crate::ir::{OpCode, Record};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O Error: {0}")]
    IoError(#[from] io::Error),
    #[error("tape pointer ran off the left edge: {0}")]
    NegativePointer(isize),
    #[error("cell {0} lies past the end of the fixed tape")]
    TapeOverrun(usize),
    #[error("corrupt instruction stream in `{procedure}` at slot {slot}")]
    BadInstruction { procedure: String, slot: usize },
    #[error("RETURN or RESTORE with no matching frame")]
    CallStackUnderflow,
}

/// The cell array. Allocated up-front and zero-filled. The abstract machine
/// has a zero in every cell it has never written, so reads past the
/// allocation simply see zero; only a write materialises a cell, and a
/// write past the allocation either extends it or faults, depending on
/// construction.
#[derive(Debug)]
pub struct Tape {
    cells: Vec<u8>,
    growable: bool,
}

impl Tape {
    /// A tape on which a write past `len` is fatal.
    pub fn fixed(len: usize) -> Self {
        Self {
            cells: vec![0; len],
            growable: false,
        }
    }
    /// A tape that zero-fills rightwards whenever a write lands past the
    /// current allocation.
    pub fn growable(len: usize) -> Self {
        Self {
            cells: vec![0; len],
            growable: true,
        }
    }
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }
    #[inline]
    fn cell(&self, index: usize) -> u8 {
        self.cells.get(index).copied().unwrap_or(0)
    }
    #[inline]
    fn cell_mut(&mut self, index: usize) -> Result<&mut u8> {
        if index >= self.cells.len() {
            if !self.growable {
                return Err(Error::TapeOverrun(index));
            }
            let new_len = (index + 1).max(self.cells.len() * 2);
            trace!("tape grows {} -> {}", self.cells.len(), new_len);
            self.cells.resize(new_len, 0);
        }
        Ok(&mut self.cells[index])
    }
}

/// Tape plus data pointer. All cell arithmetic wraps at 8 bits; addressing
/// left of cell zero is fatal.
#[derive(Debug)]
struct State {
    pointer: usize,
    tape: Tape,
}

impl State {
    #[inline]
    fn at(&self) -> u8 {
        self.tape.cell(self.pointer)
    }
    #[inline]
    fn at_offset_mut(&mut self, offset: isize) -> Result<&mut u8> {
        let p = self.pointer as isize + offset;
        if p < 0 {
            return Err(Error::NegativePointer(p));
        }
        self.tape.cell_mut(p as usize)
    }
    #[inline]
    fn add(&mut self, offset: isize, value: u8) -> Result<()> {
        self.at_offset_mut(offset).map(|a| *a = a.wrapping_add(value))
    }
    #[inline]
    fn sub(&mut self, offset: isize, value: u8) -> Result<()> {
        self.at_offset_mut(offset).map(|a| *a = a.wrapping_sub(value))
    }
    #[inline]
    fn set(&mut self, value: u8) -> Result<()> {
        self.tape.cell_mut(self.pointer).map(|cell| *cell = value)
    }
    #[inline]
    fn pointer_add(&mut self, n: isize) -> Result<()> {
        let p = self.pointer as isize + n;
        if p >= 0 {
            self.pointer = p as usize;
            Ok(())
        } else {
            Err(Error::NegativePointer(p))
        }
    }
    #[inline]
    fn output(&mut self, writer: &mut impl Write) -> Result<()> {
        let value = self.at();
        writer.write_all(&[value])?;
        writer.flush()?;
        Ok(())
    }
    #[inline]
    fn input(&mut self, reader: &mut impl Read) -> Result<()> {
        let mut buf = [0];
        match reader.read_exact(&mut buf) {
            Ok(()) => self.set(buf[0])?,
            // End of input leaves the cell untouched.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// One call-stack slot: either where a CALL came from, or a cell value
/// parked by SAVE.
#[derive(Debug)]
enum Frame {
    Return { procedure: usize, pc: usize },
    Saved { location: usize, value: u8 },
}

/// Dispatch loop over a loaded image. The program counter walks opcode and
/// operand slots in lockstep; branch operands are consumed whether or not
/// the jump is taken.
pub struct Engine<'a, R: Read, W: Write> {
    image: &'a Image,
    state: State,
    procedure: usize,
    pc: usize,
    data_stack: Vec<u8>,
    call_stack: Vec<Frame>,
    halted: bool,
    input: R,
    output: W,
}

impl<'a, R: Read, W: Write> Engine<'a, R, W> {
    pub fn builder() -> EngineBuilder<'a, R, W> {
        EngineBuilder::default()
    }

    fn new(image: &'a Image, input: R, output: W, tape: Tape) -> Self {
        Self {
            image,
            state: State { pointer: 0, tape },
            procedure: image.main(),
            pc: 0,
            data_stack: Vec::new(),
            call_stack: Vec::new(),
            halted: false,
            input,
            output,
        }
    }

    pub fn memory(&self) -> &[u8] {
        self.state.tape.cells()
    }
    pub fn pointer(&self) -> usize {
        self.state.pointer
    }
    pub fn halted(&self) -> bool {
        self.halted
    }
    pub fn iter(&mut self) -> EngineIter<'_, 'a, R, W> {
        EngineIter(self)
    }

    /// Run to HALT, returning the number of dispatched instructions.
    pub fn run(&mut self) -> Result<usize> {
        let mut steps = 0;
        while !self.halted {
            self.step()?;
            steps += 1;
        }
        Ok(steps)
    }

    fn bad(&self, slot: usize) -> Error {
        Error::BadInstruction {
            procedure: self.image.name(self.procedure).to_owned(),
            slot,
        }
    }

    fn fetch_op(&mut self) -> Result<OpCode> {
        match self.image.code(self.procedure).get(self.pc) {
            Some(Record::Op(op)) => {
                self.pc += 1;
                Ok(*op)
            }
            _ => Err(self.bad(self.pc)),
        }
    }

    fn fetch_operand(&mut self) -> Result<i64> {
        match self.image.code(self.procedure).get(self.pc) {
            Some(Record::Operand(n)) => {
                self.pc += 1;
                Ok(*n)
            }
            _ => Err(self.bad(self.pc)),
        }
    }

    fn fetch_dyad(&mut self) -> Result<(i32, i32)> {
        match self.image.code(self.procedure).get(self.pc) {
            Some(Record::Dyad(high, low)) => {
                self.pc += 1;
                Ok((*high, *low))
            }
            _ => Err(self.bad(self.pc)),
        }
    }

    fn jump(&mut self, target: i64) -> Result<()> {
        self.pc = usize::try_from(target).map_err(|_| self.bad(self.pc))?;
        Ok(())
    }

    #[inline]
    pub fn step(&mut self) -> Result<()> {
        let op = self.fetch_op()?;
        match op {
            OpCode::Incr => self.state.add(0, 1)?,
            OpCode::Decr => self.state.sub(0, 1)?,
            OpCode::Add => {
                let n = self.fetch_operand()?;
                self.state.add(0, n as u8)?;
            }
            OpCode::AddOffset => {
                let (offset, by) = self.fetch_dyad()?;
                self.state.add(offset as isize, by as u8)?;
            }
            OpCode::XfrMultiple => {
                let (offset, by) = self.fetch_dyad()?;
                // A zero cell transfers nothing, exactly like the loop
                // this instruction replaces.
                let multiplier = self.state.at();
                if multiplier != 0 {
                    // Multiply in 64 bits; truncation to u8 is the
                    // mod-256 store.
                    let value = (multiplier as i64).wrapping_mul(by as i64) as u8;
                    self.state.add(offset as isize, value)?;
                    self.state.set(0)?;
                }
            }
            OpCode::SetZero => self.state.set(0)?,
            OpCode::Left => self.state.pointer_add(-1)?,
            OpCode::Right => self.state.pointer_add(1)?,
            OpCode::Move => {
                let n = self.fetch_operand()?;
                self.state.pointer_add(n as isize)?;
            }
            OpCode::SeekLeft => {
                while self.state.at() != 0 {
                    self.state.pointer_add(-1)?;
                }
            }
            OpCode::SeekRight => {
                while self.state.at() != 0 {
                    self.state.pointer_add(1)?;
                }
            }
            OpCode::Open => {
                let target = self.fetch_operand()?;
                if self.state.at() == 0 {
                    self.jump(target)?;
                }
            }
            OpCode::Close => {
                let target = self.fetch_operand()?;
                if self.state.at() != 0 {
                    self.jump(target)?;
                }
            }
            OpCode::Get => self.state.input(&mut self.input)?,
            OpCode::Put => self.state.output(&mut self.output)?,
            OpCode::Push => {
                let value = self.state.at();
                self.data_stack.push(value);
            }
            OpCode::Pop => {
                let value = self.data_stack.pop().unwrap_or(0);
                self.state.set(value)?;
            }
            OpCode::Call => {
                let slot = self.pc;
                let target = self.fetch_operand()?;
                let callee = usize::try_from(target)
                    .ok()
                    .filter(|p| *p < self.image.procedure_count())
                    .ok_or_else(|| self.bad(slot))?;
                self.call_stack.push(Frame::Return {
                    procedure: self.procedure,
                    pc: self.pc,
                });
                self.procedure = callee;
                self.pc = 0;
            }
            OpCode::Return => match self.call_stack.pop() {
                Some(Frame::Return { procedure, pc }) => {
                    self.procedure = procedure;
                    self.pc = pc;
                }
                _ => return Err(Error::CallStackUnderflow),
            },
            OpCode::Save => {
                let value = self.state.at();
                self.call_stack.push(Frame::Saved {
                    location: self.state.pointer,
                    value,
                });
                self.state.set(0)?;
            }
            OpCode::Restore => match self.call_stack.pop() {
                Some(Frame::Saved { location, value }) => {
                    *self.state.tape.cell_mut(location)? = value;
                }
                _ => return Err(Error::CallStackUnderflow),
            },
            OpCode::Halt => self.halted = true,
        }
        Ok(())
    }
}

pub struct EngineIter<'e, 'a, R: Read, W: Write>(&'e mut Engine<'a, R, W>);

impl<R: Read, W: Write> Iterator for EngineIter<'_, '_, R, W> {
    type Item = Result<()>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.0.halted {
            None
        } else {
            Some(self.0.step())
        }
    }
}

pub struct EngineBuilder<'a, R: Read, W: Write> {
    image: Option<&'a Image>,
    tape: Option<Tape>,
    input: Option<R>,
    output: Option<W>,
}

impl<'a, R: Read, W: Write> Default for EngineBuilder<'a, R, W> {
    fn default() -> Self {
        Self {
            image: Default::default(),
            tape: Default::default(),
            input: Default::default(),
            output: Default::default(),
        }
    }
}

impl<'a, R: Read, W: Write> EngineBuilder<'a, R, W> {
    pub fn image(self, image: &'a Image) -> Self {
        Self {
            image: Some(image),
            ..self
        }
    }
    pub fn tape(self, tape: Tape) -> Self {
        Self {
            tape: Some(tape),
            ..self
        }
    }
    pub fn input(self, input: R) -> Self {
        Self {
            input: Some(input),
            ..self
        }
    }
    pub fn output(self, output: W) -> Self {
        Self {
            output: Some(output),
            ..self
        }
    }
    pub fn build(self) -> Engine<'a, R, W> {
        let Self {
            image,
            tape,
            input,
            output,
        } = self;

        let image = image.unwrap();
        let input = input.unwrap();
        let output = output.unwrap();
        let tape = tape.unwrap();

        Engine::new(image, input, output, tape)
    }
}
