//! Machine — reference interpreter for compiled programs.
//!
//! Memory is one word stack plus 256 closures of 64 words each. Loading a
//! program copies every instruction except the marker onto the bottom of
//! the stack; the program window starts right after them.
//!
//! ```text
//!   stack   [ code ........ ][ program window ][ callee windows ... ]
//!           0               last
//!
//!   register byte   bank:2 offset:6
//!     r  top + offset           current window
//!     c  closures[closure]      captured values of the running function
//!     a  closures[aux]          closure being filled by CLMK / AUX
//!     b  base + offset          program window
//! ```
//!
//! A function word packs the code address in its low 16 bits and the
//! closure index in its top byte. Closure 0 is shared by every plain
//! function and is never released.
//!
//! Status codes: 0 finished, -1 empty program or tick limit, -2 invalid
//! opcode, -3 memory fault, -4 division by zero. A trap returning any
//! other non-zero value halts with that value.

use crate::bytecode::{Bank, Instruction, Op, Program, Reg};
use crate::errors::RuntimeError;
use tracing::{debug, trace};

pub const STACK_SIZE: usize = 1 << 16;
pub const CLOSURE_SIZE: usize = 1 << 6;
pub const CLOSURE_COUNT: usize = 256;
/// Instructions a program may execute before it is stopped.
pub const TICK_LIMIT: u32 = 1 << 12;

const EXHAUSTED: i32 = -1;
const INVALID_OPCODE: i32 = -2;
const MEMORY_FAULT: i32 = -3;
const DIVISION_BY_ZERO: i32 = -4;

/// What a run produced: the program window and everything printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub registers: Vec<i32>,
    pub output: String,
}

#[derive(Debug, Clone, Copy)]
struct Function {
    address: u16,
    closure: u8,
}

impl Function {
    fn from_word(word: i32) -> Self {
        let bits = word as u32;
        Self {
            address: bits as u16,
            closure: (bits >> 24) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cell {
    Stack(usize),
    Closure(usize),
}

pub struct Machine {
    stack: Vec<i32>,
    closures: Vec<i32>,
    /// Free list: `sorted[cc..]` are the unused closure indices.
    sorted: [u8; 255],
    rc: [u8; CLOSURE_COUNT],
    cc: u8,
    pc: usize,
    top: usize,
    base: usize,
    closure: usize,
    aux: usize,
    ticks: u32,
    tick_limit: u32,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            stack: vec![0; STACK_SIZE],
            closures: vec![0; CLOSURE_COUNT * CLOSURE_SIZE],
            sorted: std::array::from_fn(|i| i as u8 + 1),
            rc: [0; CLOSURE_COUNT],
            cc: 0,
            pc: 0,
            top: 0,
            base: 0,
            closure: 0,
            aux: 0,
            ticks: 0,
            tick_limit: TICK_LIMIT,
        }
    }

    pub fn with_tick_limit(mut self, limit: u32) -> Self {
        self.tick_limit = limit;
        self
    }

    /// Instructions executed by the last run.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Load and run `program`. `trap` sees every instruction before it
    /// executes and halts the run by returning non-zero; `print` receives
    /// the text of every `PRNT`.
    pub fn run<T, P>(&mut self, program: &[Instruction], mut trap: T, mut print: P) -> i32
    where
        T: FnMut(u16, Instruction) -> i32,
        P: FnMut(&str),
    {
        let Some(marker) = program.last() else {
            return EXHAUSTED;
        };
        let last = program.len() - 1;
        if last >= STACK_SIZE {
            return MEMORY_FAULT;
        }

        self.stack.fill(0);
        self.closures.fill(0);
        for (slot, inst) in self.stack.iter_mut().zip(&program[..last]) {
            *slot = inst.encode() as i32;
        }
        for (i, slot) in self.sorted.iter_mut().enumerate() {
            *slot = i as u8 + 1;
        }
        self.rc = [0; CLOSURE_COUNT];
        self.cc = 0;
        self.pc = usize::from(marker.yz);
        self.top = last;
        self.base = last;
        self.closure = 0;
        self.aux = 0;
        self.ticks = 0;

        let entry = Function {
            address: marker.yz,
            closure: 0,
        };
        let status = match self.call(entry, 0, &mut trap, &mut print) {
            Ok(()) => 0,
            Err(status) => status,
        };
        debug!(status, ticks = self.ticks, "program halted");
        status
    }

    /// Run `program` with no trap and collect the first `registers`
    /// words of the program window.
    pub fn execute(
        &mut self,
        program: &Program,
        registers: usize,
    ) -> Result<Execution, RuntimeError> {
        let mut output = String::new();
        let status = self.run(&program.instructions, |_, _| 0, |text| output.push_str(text));
        if status != 0 {
            return Err(RuntimeError { status });
        }
        Ok(Execution {
            registers: (0..registers)
                .map(|i| self.register(Bank::Local, i).unwrap_or_default())
                .collect(),
            output,
        })
    }

    /// Read a register relative to the current bank pointers. After a run
    /// these point at the program window again.
    pub fn register(&self, bank: Bank, offset: usize) -> Option<i32> {
        let raw = Reg::new(bank, offset).ok()?.raw();
        self.read(raw).ok()
    }

    // ── Execution ───────────────────────────────────────────────────

    fn call<T, P>(
        &mut self,
        function: Function,
        frame: u8,
        trap: &mut T,
        print: &mut P,
    ) -> Result<(), i32>
    where
        T: FnMut(u16, Instruction) -> i32,
        P: FnMut(&str),
    {
        let (ret, stk, clr) = (self.pc, self.top, self.closure);
        self.top += usize::from(frame);
        self.pc = usize::from(function.address);
        self.closure = usize::from(function.closure);

        loop {
            if self.ticks >= self.tick_limit {
                return Err(EXHAUSTED);
            }
            self.ticks += 1;

            let word = *self.stack.get(self.pc).ok_or(MEMORY_FAULT)?;
            let inst = Instruction::decode(word as u32).ok_or(INVALID_OPCODE)?;
            let halt = trap(self.pc as u16, inst);
            if halt != 0 {
                return Err(halt);
            }
            trace!(pc = self.pc, %inst);

            let (x, y, z) = (inst.x, inst.y(), inst.z());
            match inst.op {
                Op::LoadLow => self.write(x, i32::from(inst.yz))?,
                Op::LoadHigh => {
                    let value = self.read(x)? | (u32::from(inst.yz) << 16) as i32;
                    self.write(x, value)?;
                }
                Op::Move => {
                    let value = self.read(y)?;
                    self.write(x, value)?;
                }
                Op::LoadStack => {
                    let at = self.address(self.read(y)?, z)?;
                    self.write(x, self.stack[at])?;
                }
                Op::StoreStack => {
                    let at = self.address(self.read(x)?, y)?;
                    self.stack[at] = self.read(z)?;
                }
                Op::Inc => {
                    let value = self.read(x)?.wrapping_add(i32::from(inst.yz));
                    self.write(x, value)?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Nand | Op::Shl | Op::Shr => {
                    let (a, b) = (self.read(y)?, self.read(z)?);
                    let value = match inst.op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Mul => a.wrapping_mul(b),
                        Op::Div if b == 0 => return Err(DIVISION_BY_ZERO),
                        Op::Div => a.wrapping_div(b),
                        Op::Mod if b == 0 => return Err(DIVISION_BY_ZERO),
                        Op::Mod => a.wrapping_rem(b),
                        Op::Nand => !(a & b),
                        Op::Shl => a.wrapping_shl(b as u32),
                        _ => a.wrapping_shr(b as u32),
                    };
                    self.write(x, value)?;
                }
                Op::Print => {
                    let text = self.c_string(x);
                    print(&text);
                }
                Op::Frame => {
                    let top = self.top as isize + isize::from(inst.yz as i16);
                    self.top = usize::try_from(top).map_err(|_| MEMORY_FAULT)?;
                }
                Op::ClosureMake => {
                    let closure = self.alloc();
                    self.aux = usize::from(closure);
                    self.write(x, (u32::from(closure) << 24 | u32::from(inst.yz)) as i32)?;
                }
                Op::Retain => {
                    let closure = Function::from_word(self.read(x)?).closure;
                    self.rc[usize::from(closure)] = self.rc[usize::from(closure)].wrapping_add(1);
                }
                Op::Release => {
                    let closure = Function::from_word(self.read(x)?).closure;
                    self.release(closure);
                }
                Op::Aux => self.aux = usize::from(x),
                Op::Call => {
                    let function = Function {
                        address: inst.yz,
                        closure: 0,
                    };
                    self.call(function, x, trap, print)?;
                }
                Op::CallRx => {
                    let function = Function::from_word(self.read(y)?);
                    self.call(function, x, trap, print)?;
                }
                Op::Ret => {
                    self.pc = ret;
                    self.top = stk;
                    self.closure = clr;
                    return Ok(());
                }
                Op::Break => {}
            }
            self.pc += 1;
        }
    }

    // ── Memory ──────────────────────────────────────────────────────

    fn cell(&self, raw: u8) -> Cell {
        let reg = Reg::from_raw(raw);
        match reg.bank() {
            Bank::Local => Cell::Stack(self.top + reg.offset()),
            Bank::Base => Cell::Stack(self.base + reg.offset()),
            Bank::Closure => Cell::Closure(self.closure * CLOSURE_SIZE + reg.offset()),
            Bank::Aux => Cell::Closure(self.aux * CLOSURE_SIZE + reg.offset()),
        }
    }

    fn read(&self, raw: u8) -> Result<i32, i32> {
        let word = match self.cell(raw) {
            Cell::Stack(at) => self.stack.get(at),
            Cell::Closure(at) => self.closures.get(at),
        };
        word.copied().ok_or(MEMORY_FAULT)
    }

    fn write(&mut self, raw: u8, value: i32) -> Result<(), i32> {
        let word = match self.cell(raw) {
            Cell::Stack(at) => self.stack.get_mut(at),
            Cell::Closure(at) => self.closures.get_mut(at),
        };
        *word.ok_or(MEMORY_FAULT)? = value;
        Ok(())
    }

    fn address(&self, base: i32, offset: u8) -> Result<usize, i32> {
        usize::try_from(i64::from(base) + i64::from(offset))
            .ok()
            .filter(|at| *at < STACK_SIZE)
            .ok_or(MEMORY_FAULT)
    }

    /// Bytes from the register at `raw` onward, four per word, up to the
    /// first NUL.
    fn c_string(&self, raw: u8) -> String {
        let words = match self.cell(raw) {
            Cell::Stack(at) => self.stack.get(at..).unwrap_or_default(),
            Cell::Closure(at) => self.closures.get(at..).unwrap_or_default(),
        };
        let bytes: Vec<u8> = words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .take_while(|b| *b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // ── Closures ────────────────────────────────────────────────────

    fn alloc(&mut self) -> u8 {
        if usize::from(self.cc) < self.sorted.len() {
            let closure = self.sorted[usize::from(self.cc)];
            self.cc += 1;
            closure
        } else {
            0
        }
    }

    fn release(&mut self, closure: u8) {
        let index = usize::from(closure);
        if closure == 0 {
            return;
        }
        self.rc[index] = self.rc[index].wrapping_sub(1);
        if self.rc[index] != 0 || self.cc == 0 {
            return;
        }
        self.cc -= 1;
        let cc = usize::from(self.cc);
        if let Some(i) = self.sorted[..=cc].iter().rposition(|c| *c == closure) {
            self.sorted.swap(i, cc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide(op: Op, x: u8, yz: u16) -> Instruction {
        Instruction::wide(op, x, yz)
    }

    fn triple(op: Op, x: usize, y: usize, z: usize) -> Instruction {
        let reg = |offset| Reg::local(offset).unwrap();
        Instruction::triple(op, reg(x), reg(y), reg(z))
    }

    /// Append the marker for a program whose body starts at `entry`.
    fn program(mut body: Vec<Instruction>, entry: u16) -> Vec<Instruction> {
        body.push(wide(Op::Call, 0, entry));
        body
    }

    fn run(code: &[Instruction]) -> (i32, Machine) {
        let mut machine = Machine::new();
        let status = machine.run(code, |_, _| 0, |_| {});
        (status, machine)
    }

    #[test]
    fn test_empty_program() {
        let (status, _) = run(&[]);
        assert_eq!(status, -1);
    }

    #[test]
    fn test_load_and_add() {
        let code = program(
            vec![
                wide(Op::LoadLow, 0, 100),
                wide(Op::LoadLow, 1, 10),
                triple(Op::Add, 0, 0, 1),
                wide(Op::LoadLow, 2, 0xffff),
                wide(Op::LoadHigh, 2, 0xffff),
                wide(Op::Ret, 0, 0),
            ],
            0,
        );
        let (status, machine) = run(&code);
        assert_eq!(status, 0);
        assert_eq!(machine.register(Bank::Local, 0), Some(110));
        assert_eq!(machine.register(Bank::Local, 2), Some(-1));
    }

    #[test]
    fn test_call_shifts_window() {
        // fn @0: r0 = r1 * 2
        // main @3: r0 = 21; r2 = @0; r4 = r0; FNRX +3 r2; r1 = r3
        let code = program(
            vec![
                wide(Op::LoadLow, 2, 2),
                triple(Op::Mul, 0, 1, 2),
                wide(Op::Ret, 0, 0),
                wide(Op::LoadLow, 0, 21),
                wide(Op::LoadLow, 2, 0),
                triple(Op::Move, 4, 0, 0),
                Instruction::wide(Op::CallRx, 3, 2),
                triple(Op::Move, 1, 3, 0),
                wide(Op::Ret, 0, 0),
            ],
            3,
        );
        let (status, machine) = run(&code);
        assert_eq!(status, 0);
        assert_eq!(machine.register(Bank::Local, 1), Some(42));
    }

    #[test]
    fn test_closure_bank() {
        // fn @0: r0 = c0 + r1
        // main @2: CLMK r0 @0; a0 = r1 (7); r3 = 5; FNRX +2 r0; r1 = r2
        let code = program(
            vec![
                Instruction::triple(
                    Op::Add,
                    Reg::local(0).unwrap(),
                    Reg::new(Bank::Closure, 0).unwrap(),
                    Reg::local(1).unwrap(),
                ),
                wide(Op::Ret, 0, 0),
                wide(Op::LoadLow, 1, 7),
                wide(Op::ClosureMake, 0, 0),
                Instruction::triple(
                    Op::Move,
                    Reg::new(Bank::Aux, 0).unwrap(),
                    Reg::local(1).unwrap(),
                    Reg::local(0).unwrap(),
                ),
                wide(Op::LoadLow, 3, 5),
                Instruction::wide(Op::CallRx, 2, 0),
                triple(Op::Move, 1, 2, 0),
                wide(Op::Ret, 0, 0),
            ],
            2,
        );
        let (status, machine) = run(&code);
        assert_eq!(status, 0);
        assert_eq!(machine.register(Bank::Local, 1), Some(12));
        assert_eq!(machine.register(Bank::Local, 0).map(|w| w >> 24), Some(1));
    }

    #[test]
    fn test_print_reads_packed_string() {
        let code = program(
            vec![
                wide(Op::LoadLow, 0, u16::from_le_bytes([b'H', b'i'])),
                wide(Op::LoadHigh, 0, u16::from_le_bytes([b'!', 0])),
                wide(Op::Print, 0, 0),
                wide(Op::Ret, 0, 0),
            ],
            0,
        );
        let mut printed = String::new();
        let status = Machine::new().run(&code, |_, _| 0, |s| printed.push_str(s));
        assert_eq!(status, 0);
        assert_eq!(printed, "Hi!");
    }

    #[test]
    fn test_trap_halts() {
        let code = program(vec![wide(Op::Break, 0, 0), wide(Op::Ret, 0, 0)], 0);
        let mut seen = Vec::new();
        let status = Machine::new().run(
            &code,
            |pc, inst| {
                seen.push((pc, inst.op));
                if inst.op == Op::Ret {
                    7
                } else {
                    0
                }
            },
            |_| {},
        );
        assert_eq!(status, 7);
        assert_eq!(seen, vec![(0, Op::Break), (1, Op::Ret)]);
    }

    #[test]
    fn test_tick_limit() {
        // Calls itself until the limit is hit.
        let code = program(vec![wide(Op::Call, 0, 0)], 0);
        let mut machine = Machine::new().with_tick_limit(10);
        assert_eq!(machine.run(&code, |_, _| 0, |_| {}), -1);
        assert_eq!(machine.ticks(), 10);

        let mut machine = Machine::new().with_tick_limit(100);
        assert_eq!(machine.run(&code, |_, _| 0, |_| {}), -1);
        assert_eq!(machine.ticks(), 100);
    }

    #[test]
    fn test_invalid_opcode() {
        // r0 sits at address 3, right after the code; call into it.
        let code = program(
            vec![
                wide(Op::LoadLow, 0, 0xff),
                wide(Op::Call, 0, 3),
                wide(Op::Ret, 0, 0),
            ],
            0,
        );
        let (status, _) = run(&code);
        assert_eq!(status, -2);
    }

    #[test]
    fn test_division_by_zero() {
        let code = program(vec![triple(Op::Div, 0, 1, 2), wide(Op::Ret, 0, 0)], 0);
        let (status, _) = run(&code);
        assert_eq!(status, -4);
    }

    #[test]
    fn test_memory_fault() {
        let code = program(
            vec![
                wide(Op::LoadLow, 0, 0xffff),
                wide(Op::LoadHigh, 0, 0x7fff),
                triple(Op::LoadStack, 1, 0, 0),
                wide(Op::Ret, 0, 0),
            ],
            0,
        );
        let (status, _) = run(&code);
        assert_eq!(status, -3);
    }

    #[test]
    fn test_closure_release_recycles() {
        let mut machine = Machine::new();
        assert_eq!(machine.alloc(), 1);
        assert_eq!(machine.alloc(), 2);
        machine.rc[1] = 1;
        machine.release(1);
        assert_eq!(machine.cc, 1);
        assert_eq!(machine.alloc(), 1);
        machine.release(0);
        assert_eq!(machine.cc, 2);
    }
}
