use if_chain::if_chain;
use log::info;

use crate::error::Error;
use crate::ir::{OpCode, Program, Record};
use crate::scan::{Scanner, Source};

/// Which peephole rewrites the planter is allowed to apply. Everything is
/// off by default; `--all` and the per-feature toggles build on that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Skip loops whose guard cell is provably zero.
    pub dead_code: bool,
    /// Lift `[>]` / `[<]` into SEEK_RIGHT / SEEK_LEFT.
    pub seek_zero: bool,
    /// Lift `[+]` / `[-]` into SET_ZERO.
    pub prune_if_loc_is_zero: bool,
    /// Lift balanced transfer loops into XFR_MULTIPLE.
    pub xfr_multiple: bool,
    /// Unplant stores that an immediately following SET_ZERO discards.
    pub superfluous: bool,
}

impl Flags {
    pub fn all() -> Self {
        Self {
            dead_code: true,
            seek_zero: true,
            prune_if_loc_is_zero: true,
            xfr_multiple: true,
            superfluous: true,
        }
    }
    pub fn none() -> Self {
        Self::default()
    }
}

/// The rolling `MOVE lhs; ADD by; MOVE rhs` window every peephole decision
/// is phrased over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveAddMove {
    pub lhs: i32,
    pub by: i32,
    pub rhs: i32,
}

impl MoveAddMove {
    fn matches(&self, lhs: i32, by: i32, rhs: i32) -> bool {
        self.lhs == lhs && self.by == by && self.rhs == rhs
    }
    /// Moves out and exactly back: the shape of a transfer loop.
    fn is_nonzero_balanced(&self) -> bool {
        self.lhs != 0 && self.lhs + self.rhs == 0
    }
}

fn scan_add(input: &mut impl Source, initial: i32) -> i32 {
    let mut n = initial;
    loop {
        if input.try_consume('+') {
            n += 1;
        } else if input.try_consume('-') {
            n -= 1;
        } else {
            return n;
        }
    }
}

fn scan_move(input: &mut impl Source, initial: i32) -> i32 {
    let mut n = initial;
    loop {
        if input.try_consume('>') {
            n += 1;
        } else if input.try_consume('<') {
            n -= 1;
        } else {
            return n;
        }
    }
}

fn scan_move_add_move(input: &mut impl Source, initial: i32) -> MoveAddMove {
    let lhs = scan_move(input, initial);
    let by = scan_add(input, 0);
    let rhs = scan_move(input, 0);
    MoveAddMove { lhs, by, rhs }
}

/// Translates a command stream into an instruction stream, folding runs and
/// recognising loop idioms as it goes. The only cross-instruction state is
/// `loc_is_zero`: whether the current cell is provably zero at the point
/// about to be planted.
pub struct CodePlanter {
    program: Program,
    open_indexes: Vec<usize>,
    loc_is_zero: bool,
    flags: Flags,
}

/// Lift a whole source text under the given flags.
pub fn lift(source: &str, flags: Flags) -> Result<Program, Error> {
    CodePlanter::new(flags).plant_program(&mut Scanner::of(source))
}

impl CodePlanter {
    pub fn new(flags: Flags) -> Self {
        Self {
            program: Program::new(),
            open_indexes: Vec::new(),
            loc_is_zero: true,
            flags,
        }
    }

    /// Procedure bodies other than `main` run with an arbitrary current
    /// cell, so the zero fact must not be assumed on entry.
    pub(crate) fn assume_unknown_cell(&mut self) {
        self.loc_is_zero = false;
    }

    pub fn plant_program(mut self, input: &mut impl Source) -> Result<Program, Error> {
        while self.plant_expr(input)? {}
        if !self.open_indexes.is_empty() {
            return Err(Error::UnmatchedOpen {
                count: self.open_indexes.len(),
            });
        }
        self.plant_op(OpCode::Halt);
        Ok(self.program)
    }

    pub(crate) fn open_depth(&self) -> usize {
        self.open_indexes.len()
    }

    pub(crate) fn into_program(mut self, terminal: OpCode) -> Program {
        self.plant_op(terminal);
        self.program
    }

    pub(crate) fn plant_op(&mut self, op: OpCode) {
        self.program.push(Record::Op(op));
        self.loc_is_zero = op.zeroes_loc();
    }
    fn plant_operand(&mut self, n: i64) {
        self.program.push(Record::Operand(n));
    }
    fn plant_dyad(&mut self, high: i32, low: i32) {
        self.program.push(Record::Dyad(high, low));
    }

    pub(crate) fn plant_call(&mut self, name: &str) {
        self.plant_op(OpCode::Call);
        self.program.push(Record::Ref(name.to_owned()));
    }

    fn plant_open(&mut self) {
        self.plant_op(OpCode::Open);
        // The slot right after OPEN carries its branch target; remember it
        // and plant a placeholder until the matching `]` arrives.
        self.open_indexes.push(self.program.len());
        self.plant_operand(0);
    }

    fn plant_close(&mut self, at: usize) -> Result<(), Error> {
        let start = self
            .open_indexes
            .pop()
            .ok_or(Error::UnmatchedClose { at })?;
        self.plant_op(OpCode::Close);
        let end = self.program.len();
        // Both targets point one past the partner's operand slot.
        self.program.set(start, Record::Operand(end as i64 + 1));
        self.plant_operand(start as i64 + 1);
        Ok(())
    }

    fn plant_move(&mut self, n: i32) {
        match n {
            0 => {}
            1 => self.plant_op(OpCode::Right),
            -1 => self.plant_op(OpCode::Left),
            n => {
                self.plant_op(OpCode::Move);
                self.plant_operand(n as i64);
            }
        }
    }

    fn plant_add(&mut self, n: i32) {
        match n {
            0 => {}
            1 => self.plant_op(OpCode::Incr),
            -1 => self.plant_op(OpCode::Decr),
            n => {
                self.plant_op(OpCode::Add);
                self.plant_operand(n as i64);
            }
        }
    }

    fn plant_add_offset(&mut self, offset: i32, by: i32) {
        self.plant_op(OpCode::AddOffset);
        self.plant_dyad(offset, by);
    }

    fn plant_xfr_multiple(&mut self, offset: i32, by: i32) {
        info!("lifted transfer loop: offset={offset} by={by}");
        self.plant_op(OpCode::XfrMultiple);
        self.plant_dyad(offset, by);
    }

    /// Normalise a scanned window into at most a MOVE, an add form and a
    /// pure move, re-scanning whenever the tail of one window can seed the
    /// head of the next. Iterative on purpose: long runs of `+-<>` must not
    /// grow the host stack.
    fn plant_move_add_move(&mut self, input: &mut impl Source, window: MoveAddMove) {
        let mut mam = window;
        loop {
            if mam.by == 0 {
                // A pure move; fold any further move characters into it.
                if mam.rhs == 0 {
                    self.plant_move(mam.lhs);
                    return;
                }
                mam = scan_move_add_move(input, mam.lhs + mam.rhs);
            } else if mam.lhs != 0 && mam.rhs != 0 && mam.lhs.signum() != mam.rhs.signum() {
                // The add-at-an-offset family: out, add, (partly) back.
                let abs_lhs = mam.lhs.abs();
                let abs_rhs = mam.rhs.abs();
                if abs_lhs == abs_rhs {
                    self.plant_add_offset(mam.lhs, mam.by);
                    return;
                } else if abs_lhs > abs_rhs {
                    self.plant_move(mam.lhs.signum() * (abs_lhs - abs_rhs));
                    self.plant_add_offset(mam.lhs.signum() * abs_rhs, mam.by);
                    return;
                } else {
                    self.plant_add_offset(mam.lhs, mam.by);
                    mam = scan_move_add_move(input, mam.rhs.signum() * (abs_rhs - abs_lhs));
                }
            } else {
                self.plant_move(mam.lhs);
                self.plant_add(mam.by);
                mam = scan_move_add_move(input, mam.rhs);
            }
        }
    }

    /// Strip trailing stores whose effect the SET_ZERO about to be planted
    /// would discard. Never removes a pointer move or a loop marker, so no
    /// branch target can dangle.
    fn unplant_superfluous(&mut self) {
        while let Some(slots) = self.trailing_discardable() {
            let len = self.program.len();
            self.program.truncate(len - slots);
        }
    }

    fn trailing_discardable(&self) -> Option<usize> {
        let len = self.program.len();
        match self.program.get(len.checked_sub(1)?)? {
            Record::Op(op) if op.discard_before_set_zero() => Some(1),
            Record::Operand(_) => {
                if_chain! {
                    if let Some(back) = len.checked_sub(2);
                    if let Some(Record::Op(OpCode::Add)) = self.program.get(back);
                    then { Some(2) } else { None }
                }
            }
            _ => None,
        }
    }

    fn plant_set_zero(&mut self) {
        if self.flags.superfluous {
            self.unplant_superfluous();
        }
        info!("lifted zeroing loop");
        self.plant_op(OpCode::SetZero);
    }

    /// The guard cell is zero, so the loop body can never run. Consume it,
    /// brackets and all, and plant nothing.
    fn skip_dead_loop(&self, input: &mut impl Source) -> Result<(), Error> {
        let mut depth = 1usize;
        while depth > 0 {
            match input.pop() {
                Some('[') => depth += 1,
                Some(']') => depth -= 1,
                Some(_) => {}
                None => {
                    if !input.skip_opaque() {
                        return Err(Error::UnmatchedOpen {
                            count: self.open_indexes.len() + depth,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn plant_loop(&mut self, input: &mut impl Source) -> Result<(), Error> {
        if self.loc_is_zero && self.flags.dead_code {
            info!("dropped dead loop");
            return self.skip_dead_loop(input);
        }
        let mam = scan_move_add_move(input, 0);
        let bump = mam.matches(0, 1, 0) || mam.matches(0, -1, 0);
        if self.flags.prune_if_loc_is_zero && bump && input.try_consume(']') {
            self.plant_set_zero();
        } else if self.flags.seek_zero
            && !self.loc_is_zero
            && mam.matches(1, 0, 0)
            && input.try_consume(']')
        {
            info!("lifted seek loop");
            self.plant_op(OpCode::SeekRight);
        } else if self.flags.seek_zero
            && !self.loc_is_zero
            && mam.matches(-1, 0, 0)
            && input.try_consume(']')
        {
            info!("lifted seek loop");
            self.plant_op(OpCode::SeekLeft);
        } else if self.flags.xfr_multiple
            && mam.is_nonzero_balanced()
            && input.try_consume_sequence("-]")
        {
            // [>++<-] and friends: decrement drives the transfer.
            self.plant_xfr_multiple(mam.lhs, mam.by);
        } else if self.flags.xfr_multiple && mam.lhs == 0 && mam.by == -1 && mam.rhs != 0 {
            // [->++<] and friends: the decrement leads, so the transfer
            // shape sits in the next window.
            let tail = scan_move_add_move(input, mam.rhs);
            if tail.is_nonzero_balanced() && input.try_consume(']') {
                self.plant_xfr_multiple(tail.lhs, tail.by);
            } else {
                self.plant_open();
                self.plant_add(-1);
                self.plant_move_add_move(input, tail);
            }
        } else {
            self.plant_open();
            self.plant_move_add_move(input, mam);
        }
        Ok(())
    }

    /// Plant whatever the next command character calls for. Returns false
    /// once the input is exhausted.
    pub(crate) fn plant_expr(&mut self, input: &mut impl Source) -> Result<bool, Error> {
        let Some(ch) = input.pop() else {
            return Ok(false);
        };
        match ch {
            '+' => {
                let n = scan_add(input, 1);
                self.plant_add(n);
            }
            '-' => {
                let n = scan_add(input, -1);
                self.plant_add(n);
            }
            '>' | '<' => {
                let seed = if ch == '>' { 1 } else { -1 };
                let mam = scan_move_add_move(input, seed);
                self.plant_move_add_move(input, mam);
            }
            '[' => self.plant_loop(input)?,
            ']' => self.plant_close(input.consumed())?,
            '.' => self.plant_op(OpCode::Put),
            ',' => self.plant_op(OpCode::Get),
            _ => {}
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::ir::OpCode::*;
    use crate::ir::Record::{Dyad, Op, Operand};

    fn only(feature: fn(&mut Flags)) -> Flags {
        let mut flags = Flags::none();
        feature(&mut flags);
        flags
    }

    #[rstest]
    #[case("", Flags::none(), vec![Op(Halt)])]
    #[case("+", Flags::none(), vec![Op(Incr), Op(Halt)])]
    #[case("-", Flags::none(), vec![Op(Decr), Op(Halt)])]
    #[case("+++", Flags::none(), vec![Op(Add), Operand(3), Op(Halt)])]
    #[case("--", Flags::none(), vec![Op(Add), Operand(-2), Op(Halt)])]
    #[case("+-", Flags::none(), vec![Op(Halt)])]
    #[case(">", Flags::none(), vec![Op(Right), Op(Halt)])]
    #[case("<", Flags::none(), vec![Op(Left), Op(Halt)])]
    #[case(">>", Flags::none(), vec![Op(Move), Operand(2), Op(Halt)])]
    #[case("><", Flags::none(), vec![Op(Halt)])]
    #[case(">+<", Flags::none(), vec![Op(AddOffset), Dyad(1, 1), Op(Halt)])]
    #[case(">>+<", Flags::none(), vec![Op(Right), Op(AddOffset), Dyad(1, 1), Op(Halt)])]
    #[case(">+<<", Flags::none(), vec![Op(AddOffset), Dyad(1, 1), Op(Left), Op(Halt)])]
    #[case(
        ">>>++<<---<.",
        Flags::none(),
        vec![
            Op(Right),
            Op(AddOffset),
            Dyad(2, 2),
            Op(Add),
            Operand(-3),
            Op(Left),
            Op(Put),
            Op(Halt),
        ]
    )]
    #[case(
        "[-]",
        Flags::none(),
        vec![Op(Open), Operand(5), Op(Decr), Op(Close), Operand(2), Op(Halt)]
    )]
    #[case(
        "[[]]",
        Flags::none(),
        vec![
            Op(Open),
            Operand(8),
            Op(Open),
            Operand(6),
            Op(Close),
            Operand(4),
            Op(Close),
            Operand(2),
            Op(Halt),
        ]
    )]
    #[case("[-]", Flags::all(), vec![Op(Halt)])]
    #[case("+[-]", Flags::all(), vec![Op(SetZero), Op(Halt)])]
    #[case("++++++++[-]", Flags::all(), vec![Op(SetZero), Op(Halt)])]
    #[case(
        "++[-]",
        only(|f| f.prune_if_loc_is_zero = true),
        vec![Op(Add), Operand(2), Op(SetZero), Op(Halt)]
    )]
    #[case(
        "++[-]",
        only(|f| { f.prune_if_loc_is_zero = true; f.superfluous = true }),
        vec![Op(SetZero), Op(Halt)]
    )]
    #[case(
        "++[+]",
        only(|f| { f.prune_if_loc_is_zero = true; f.superfluous = true }),
        vec![Op(SetZero), Op(Halt)]
    )]
    #[case(
        "+[,[-]]",
        Flags::all(),
        vec![
            Op(Incr),
            Op(Open),
            Operand(7),
            Op(Get),
            Op(SetZero),
            Op(Close),
            Operand(3),
            Op(Halt),
        ]
    )]
    #[case("+[>]", only(|f| f.seek_zero = true), vec![Op(Incr), Op(SeekRight), Op(Halt)])]
    #[case("+[<]", only(|f| f.seek_zero = true), vec![Op(Incr), Op(SeekLeft), Op(Halt)])]
    // With a provably zero cell the seek rewrite must stay off.
    #[case(
        "[>]",
        only(|f| f.seek_zero = true),
        vec![Op(Open), Operand(5), Op(Right), Op(Close), Operand(2), Op(Halt)]
    )]
    #[case(
        "++[>+<-]",
        only(|f| f.xfr_multiple = true),
        vec![Op(Add), Operand(2), Op(XfrMultiple), Dyad(1, 1), Op(Halt)]
    )]
    #[case(
        "+++++[->++<]",
        only(|f| f.xfr_multiple = true),
        vec![Op(Add), Operand(5), Op(XfrMultiple), Dyad(1, 2), Op(Halt)]
    )]
    #[case(
        "++[<<<++>>>-]",
        only(|f| f.xfr_multiple = true),
        vec![Op(Add), Operand(2), Op(XfrMultiple), Dyad(-3, 2), Op(Halt)]
    )]
    // Not balanced: the decrement-led scan must fall back to a real loop.
    #[case(
        "[->++<<]",
        only(|f| f.xfr_multiple = true),
        vec![
            Op(Open),
            Operand(8),
            Op(Decr),
            Op(AddOffset),
            Dyad(1, 2),
            Op(Left),
            Op(Close),
            Operand(2),
            Op(Halt),
        ]
    )]
    #[case(
        "+++[>>++<-]",
        only(|f| f.xfr_multiple = true),
        vec![
            Op(Add),
            Operand(3),
            Op(Open),
            Operand(10),
            Op(Right),
            Op(AddOffset),
            Dyad(1, 2),
            Op(Decr),
            Op(Close),
            Operand(4),
            Op(Halt),
        ]
    )]
    #[case(
        "[ this entire loop is comment ]+",
        only(|f| f.dead_code = true),
        vec![Op(Incr), Op(Halt)]
    )]
    fn test_lift(#[case] source: &str, #[case] flags: Flags, #[case] expected: Vec<Record>) {
        let program = lift(source, flags).unwrap();
        assert_eq!(program.records(), expected.as_slice());
    }

    #[rstest]
    #[case("]", Flags::none())]
    #[case("[]]", Flags::none())]
    fn test_unmatched_close(#[case] source: &str, #[case] flags: Flags) {
        assert!(matches!(
            lift(source, flags),
            Err(Error::UnmatchedClose { .. })
        ));
    }

    #[rstest]
    #[case("[", Flags::none(), 1)]
    #[case("[[", Flags::none(), 2)]
    #[case("[[", Flags::all(), 2)]
    #[case("+[", Flags::all(), 1)]
    fn test_unmatched_open(#[case] source: &str, #[case] flags: Flags, #[case] count: usize) {
        match lift(source, flags) {
            Err(Error::UnmatchedOpen { count: reported }) => assert_eq!(reported, count),
            other => panic!("expected unmatched-open error, got {other:?}"),
        }
    }

    // Every OPEN target must address the slot one past the matching
    // CLOSE's operand, and vice versa.
    fn assert_matched_targets(program: &Program) {
        let mut stack = Vec::new();
        let mut slot = 0;
        while slot < program.len() {
            let Some(Record::Op(op)) = program.get(slot) else {
                panic!("expected opcode at {slot}");
            };
            if let Some(Record::Operand(target)) = program.get(slot + 1) {
                match op {
                    OpCode::Open => stack.push((slot, *target)),
                    OpCode::Close => {
                        let (open_slot, open_target) = stack.pop().unwrap();
                        assert_eq!(open_target as usize, slot + 2);
                        assert_eq!(*target as usize, open_slot + 2);
                    }
                    _ => {}
                }
            }
            slot += 1 + op.operand_slots();
        }
        assert!(stack.is_empty());
    }

    #[rstest]
    #[case("[[][]][,]")]
    #[case("+[+[+[-]]]")]
    #[case("[.[.].][.]")]
    fn test_branch_targets_form_a_matched_set(#[case] source: &str) {
        assert_matched_targets(&lift(source, Flags::none()).unwrap());
    }

    #[test]
    fn test_branch_targets_hold_for_generated_sources() {
        let mut seed = 0x00c0ffee_u64;
        let mut next = move || {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            seed >> 33
        };
        for _ in 0..200 {
            let mut source = String::new();
            let mut depth = 0usize;
            for _ in 0..(5 + next() % 70) {
                let ch = b"+-><.,[]"[(next() % 8) as usize] as char;
                match ch {
                    ']' if depth == 0 => continue,
                    ']' => depth -= 1,
                    '[' => depth += 1,
                    _ => {}
                }
                source.push(ch);
            }
            source.extend(std::iter::repeat(']').take(depth));
            for flags in [Flags::none(), Flags::all()] {
                assert_matched_targets(&lift(&source, flags).unwrap());
            }
        }
    }
}
