//! Just enough of an ARM machine to run the compiler's own output: the
//! instructions the emitter produces plus `printf`, `scanf`, `malloc` and
//! `__aeabi_idiv` as host routines.

use std::collections::HashMap;

const MEMORY_SIZE: usize = 1 << 20;
const DATA_BASE: u32 = 0x100;
const HEAP_BASE: u32 = 0x10000;
const RETURN_SENTINEL: i32 = -1;
const STEP_LIMIT: usize = 5_000_000;

const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;

fn register(name: &str) -> Result<usize, String> {
    let index = match name {
        "a1" => 0,
        "a2" => 1,
        "a3" => 2,
        "a4" => 3,
        "v1" => 4,
        "v2" => 5,
        "v3" => 6,
        "v4" => 7,
        "v5" => 8,
        "v6" => 9,
        "v7" => 10,
        "fp" => 11,
        "ip" => 12,
        "sp" => SP,
        "lr" => LR,
        "pc" => PC,
        _ => return Err(format!("unknown register '{}'", name)),
    };
    Ok(index)
}

/// Splits operands on top-level commas, keeping `[..]` and `{..}` whole.
fn split_operands(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// `.asciz` escapes, including the NUL bytes of the scanf buffer.
fn decode_asciz(raw: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('0') => bytes.push(0),
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some(other) => bytes.push(other as u8),
            None => bytes.push(b'\\'),
        }
    }
    bytes.push(0);
    bytes
}

#[derive(Debug, Clone)]
struct Instruction {
    op: String,
    operands: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

impl Flags {
    fn holds(&self, cond: &str) -> Result<bool, String> {
        Ok(match cond {
            "" => true,
            "eq" => self.z,
            "ne" => !self.z,
            "lt" => self.n != self.v,
            "ge" => self.n == self.v,
            "gt" => !self.z && self.n == self.v,
            "le" => self.z || self.n != self.v,
            _ => return Err(format!("unknown condition '{}'", cond)),
        })
    }
}

pub struct Machine {
    code: Vec<Instruction>,
    labels: HashMap<String, usize>,
    regs: [i32; 16],
    flags: Flags,
    memory: Vec<u8>,
    heap: u32,
    input: Vec<i32>,
    output: String,
}

impl Machine {
    /// Assembles `source` into memory.
    pub fn load(source: &str) -> Result<Self, String> {
        let mut machine = Machine {
            code: Vec::new(),
            labels: HashMap::new(),
            regs: [0; 16],
            flags: Flags::default(),
            memory: vec![0; MEMORY_SIZE],
            heap: HEAP_BASE,
            input: Vec::new(),
            output: String::new(),
        };

        let mut in_data = false;
        let mut data_cursor = DATA_BASE;
        let mut pending_label: Option<String> = None;

        for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(label) = line.strip_suffix(':') {
                if in_data {
                    pending_label = Some(label.to_string());
                } else {
                    machine.labels.insert(label.to_string(), machine.code.len());
                }
                continue;
            }
            match line.split_whitespace().next().unwrap_or_default() {
                ".data" => in_data = true,
                ".text" => in_data = false,
                ".asciz" => {
                    let start = line.find('"').ok_or("malformed .asciz")?;
                    let end = line.rfind('"').ok_or("malformed .asciz")?;
                    let bytes = decode_asciz(&line[start + 1..end]);
                    if let Some(label) = pending_label.take() {
                        machine.labels.insert(label, data_cursor as usize);
                    }
                    let at = data_cursor as usize;
                    machine.memory[at..at + bytes.len()].copy_from_slice(&bytes);
                    data_cursor += (bytes.len() as u32 + 3) & !3;
                }
                directive if directive.starts_with('.') => {}
                op => {
                    let rest = line[op.len()..].trim();
                    machine.code.push(Instruction { op: op.to_string(), operands: split_operands(rest) });
                }
            }
        }
        Ok(machine)
    }

    /// Runs from `main` until it returns. Returns everything printed.
    pub fn run(mut self, input: &str) -> Result<String, String> {
        self.input = input
            .split_whitespace()
            .rev()
            .map(|w| w.parse().map_err(|_| format!("bad input '{}'", w)))
            .collect::<Result<_, _>>()?;
        self.regs[SP] = MEMORY_SIZE as i32;
        self.regs[LR] = RETURN_SENTINEL;
        let mut pc = *self.labels.get("main").ok_or("no main label")?;

        for _ in 0..STEP_LIMIT {
            if pc as i32 == RETURN_SENTINEL {
                return Ok(self.output);
            }
            let instruction = self.code.get(pc).cloned().ok_or_else(|| format!("pc {} out of range", pc))?;
            pc = self.execute(&instruction, pc)?;
        }
        Err("step limit exceeded".to_string())
    }

    fn reg(&self, name: &str) -> Result<i32, String> {
        Ok(self.regs[register(name)?])
    }

    fn set(&mut self, name: &str, value: i32) -> Result<(), String> {
        self.regs[register(name)?] = value;
        Ok(())
    }

    fn operand2(&self, text: &str) -> Result<i32, String> {
        match text.strip_prefix('#') {
            Some(imm) => imm.parse().map_err(|_| format!("bad immediate '{}'", text)),
            None => self.reg(text),
        }
    }

    fn address(&self, addr: i32) -> Result<usize, String> {
        let addr = addr as u32 as usize;
        if addr < DATA_BASE as usize || addr + 4 > MEMORY_SIZE {
            return Err(format!("access to invalid address {:#x}", addr));
        }
        Ok(addr)
    }

    fn read_word(&self, addr: i32) -> Result<i32, String> {
        let at = self.address(addr)?;
        let mut word = [0; 4];
        word.copy_from_slice(&self.memory[at..at + 4]);
        Ok(i32::from_le_bytes(word))
    }

    fn write_word(&mut self, addr: i32, value: i32) -> Result<(), String> {
        let at = self.address(addr)?;
        self.memory[at..at + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read_cstr(&self, addr: i32) -> Result<String, String> {
        let start = self.address(addr)?;
        let len = self.memory[start..].iter().position(|b| *b == 0).ok_or("unterminated string")?;
        Ok(String::from_utf8_lossy(&self.memory[start..start + len]).into_owned())
    }

    /// `[rn]`, `[rn, #off]` or `[rn, #off]!`
    fn memory_operand(&self, text: &str) -> Result<(usize, i32, bool), String> {
        let writeback = text.ends_with('!');
        let inner = text.trim_end_matches('!').trim_start_matches('[').trim_end_matches(']');
        let mut parts = inner.split(',').map(str::trim);
        let base = register(parts.next().ok_or("empty address")?)?;
        let offset = match parts.next() {
            Some(off) => self.operand2(off)?,
            None => 0,
        };
        Ok((base, offset, writeback))
    }

    fn register_list(text: &str) -> Result<Vec<usize>, String> {
        let mut list = text
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split(',')
            .map(|r| register(r.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        list.sort_unstable();
        Ok(list)
    }

    fn subtract(&mut self, lhs: i32, rhs: i32) -> i32 {
        let (result, overflow) = lhs.overflowing_sub(rhs);
        self.flags = Flags { n: result < 0, z: result == 0, c: (lhs as u32) >= (rhs as u32), v: overflow };
        result
    }

    fn execute(&mut self, ins: &Instruction, pc: usize) -> Result<usize, String> {
        let ops = &ins.operands;
        let arg = |i: usize| ops.get(i).map(String::as_str).ok_or_else(|| format!("{} needs operand {}", ins.op, i));
        let next = pc + 1;

        match ins.op.as_str() {
            "bl" => return self.call(arg(0)?, next),
            "ldr" => {
                let source = arg(1)?;
                let value = match source.strip_prefix('=') {
                    Some(label) => match self.labels.get(label) {
                        Some(addr) => *addr as i32,
                        None => label.parse().map_err(|_| format!("unknown literal '{}'", label))?,
                    },
                    None => {
                        let (base, offset, _) = self.memory_operand(source)?;
                        self.read_word(self.regs[base].wrapping_add(offset))?
                    }
                };
                self.set(arg(0)?, value)?;
            }
            "str" => {
                let (base, offset, writeback) = self.memory_operand(arg(1)?)?;
                let addr = self.regs[base].wrapping_add(offset);
                self.write_word(addr, self.reg(arg(0)?)?)?;
                if writeback {
                    self.regs[base] = addr;
                }
            }
            "stmfd" => {
                let list = Self::register_list(arg(1)?)?;
                let mut addr = self.regs[SP] - 4 * list.len() as i32;
                self.regs[SP] = addr;
                for r in list {
                    self.write_word(addr, self.regs[r])?;
                    addr += 4;
                }
            }
            "ldmfd" => {
                let list = Self::register_list(arg(1)?)?;
                let mut addr = self.regs[SP];
                let mut target = next;
                for r in list {
                    let value = self.read_word(addr)?;
                    if r == PC {
                        target = value as usize;
                    } else {
                        self.regs[r] = value;
                    }
                    addr += 4;
                }
                self.regs[SP] = addr;
                return Ok(target);
            }
            "cmp" => {
                let (lhs, rhs) = (self.reg(arg(0)?)?, self.operand2(arg(1)?)?);
                self.subtract(lhs, rhs);
            }
            "subs" => {
                let (lhs, rhs) = (self.reg(arg(1)?)?, self.operand2(arg(2)?)?);
                let result = self.subtract(lhs, rhs);
                self.set(arg(0)?, result)?;
            }
            "add" | "sub" | "rsb" | "mul" | "and" | "orr" | "eor" => {
                let (lhs, rhs) = (self.reg(arg(1)?)?, self.operand2(arg(2)?)?);
                let result = match ins.op.as_str() {
                    "add" => lhs.wrapping_add(rhs),
                    "sub" => lhs.wrapping_sub(rhs),
                    "rsb" => rhs.wrapping_sub(lhs),
                    "mul" => lhs.wrapping_mul(rhs),
                    "and" => lhs & rhs,
                    "orr" => lhs | rhs,
                    _ => lhs ^ rhs,
                };
                self.set(arg(0)?, result)?;
            }
            op => {
                if let Some(cond) = op.strip_prefix("mov") {
                    if self.flags.holds(cond)? {
                        let value = self.operand2(arg(1)?)?;
                        self.set(arg(0)?, value)?;
                    }
                } else if let Some(cond) = op.strip_prefix('b') {
                    if self.flags.holds(cond)? {
                        let label = arg(0)?;
                        return self.labels.get(label).copied().ok_or_else(|| format!("unknown label '{}'", label));
                    }
                } else {
                    return Err(format!("unsupported instruction '{}'", op));
                }
            }
        }
        Ok(next)
    }

    fn call(&mut self, target: &str, next: usize) -> Result<usize, String> {
        match target {
            "printf" => {
                let format = self.read_cstr(self.regs[0])?;
                let text = if format.contains("%s") {
                    format.replace("%s", &self.read_cstr(self.regs[1])?)
                } else {
                    format.replace("%d", &self.regs[1].to_string())
                };
                self.output.push_str(&text);
            }
            "scanf" => {
                let value = self.input.pop().ok_or("input exhausted")?;
                self.write_word(self.regs[1], value)?;
            }
            "malloc" => {
                let size = (self.regs[0].max(4) as u32 + 3) & !3;
                self.regs[0] = self.heap as i32;
                self.heap += size;
            }
            "__aeabi_idiv" => {
                if self.regs[1] == 0 {
                    return Err("division by zero".to_string());
                }
                self.regs[0] = self.regs[0].wrapping_div(self.regs[1]);
            }
            label => {
                self.regs[LR] = next as i32;
                return self.labels.get(label).copied().ok_or_else(|| format!("unknown function '{}'", label));
            }
        }
        // Library routines clobber the argument registers
        self.regs[2] = 0x5a5a;
        self.regs[3] = 0x5a5a;
        self.regs[12] = 0x5a5a;
        Ok(next)
    }
}
