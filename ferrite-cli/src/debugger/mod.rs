//! Interactive debugger overlay over the board's run loop.

mod disasm;
mod expr;
mod names;

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use ferrite_core::board::Board;
use ferrite_core::registers::Specifier;

use expr::ExprEvaluator;
use names::{GPR_NAMES, INFO_CSRS};

/// Set from the SIGINT handler, drained between cycles.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

struct Watchpoint {
    record: u32,
    last: u32,
}

/// The interactive debugger: wraps the per-cycle call with breakpoint,
/// watchpoint, and single-step policy, and owns the command prompt.
///
/// Breakpoints are a set of program-counter values checked before each
/// fetch. Guest software can also request a pause by writing a word to the
/// debugger's MMIO window.
pub struct Debugger {
    breakpoints: BTreeMap<u32, u32>,
    watchpoints: BTreeMap<u32, Watchpoint>,
    next_point: u32,
    step_count: Option<u32>,
    eval: ExprEvaluator,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    pub fn new() -> Self {
        install_sigint_handler();
        Self {
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            next_point: 0,
            step_count: None,
            eval: ExprEvaluator::new(),
        }
    }

    /// Run the board to completion under debugger control.
    pub fn run(&mut self, board: &mut Board) {
        // Start paused at the reset vector, like any debugger attach.
        self.print_location(board);
        self.accept_commands(board);
        while !board.halted() {
            board.step();
            if board.halted() {
                break;
            }
            let mut pause = take_interrupt() | board.take_debug_pause();
            if self.check_watchpoints(board) {
                pause = true;
            }
            if let Some(count) = &mut self.step_count {
                *count -= 1;
                if *count == 0 {
                    self.step_count = None;
                    pause = true;
                }
            }
            let pc = board.core().pc();
            if let Some(id) = self.breakpoint_at(pc) {
                println!("breakpoint {id} hit at {pc:#010x}");
                pause = true;
            }
            if pause {
                self.print_location(board);
                self.accept_commands(board);
            }
        }
    }

    fn breakpoint_at(&self, pc: u32) -> Option<u32> {
        self.breakpoints
            .iter()
            .find(|(_, &addr)| addr == pc)
            .map(|(&id, _)| id)
    }

    /// Print the instruction the core is about to execute.
    fn print_location(&self, board: &Board) {
        let pc = board.core().pc();
        let word = board.bus().read_word(pc);
        println!("{pc:#010x}: {}", disasm::disassemble(word));
    }

    fn check_watchpoints(&mut self, board: &Board) -> bool {
        for (&id, watch) in &mut self.watchpoints {
            let current = match self.eval.eval_record(watch.record, board) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if current != watch.last {
                println!("watchpoint {id} hit (${})", watch.record);
                println!("  old value: {}", watch.last);
                println!("  new value: {current}");
                watch.last = current;
                return true;
            }
        }
        false
    }

    /// Command prompt; returns when execution should resume.
    fn accept_commands(&mut self, board: &mut Board) {
        self.step_count = None;
        let stdin = io::stdin();
        loop {
            print!("ferrite> ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                // EOF ends the session.
                Ok(0) => process::exit(0),
                Ok(_) => {}
                Err(_) => process::exit(0),
            }
            if line.trim().is_empty() {
                continue;
            }
            if self.dispatch_command(line.trim(), board) {
                return;
            }
        }
    }

    /// Returns `true` when the command resumes execution.
    fn dispatch_command(&mut self, line: &str, board: &mut Board) -> bool {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "help" => print_help(rest),
            "quit" | "q" => process::exit(0),
            "break" | "b" => self.cmd_break(rest, board),
            "watch" | "w" => self.cmd_watch(rest, board),
            "delete" | "d" => self.cmd_delete(rest),
            "continue" | "c" => return true,
            "stepi" | "si" => return self.cmd_stepi(rest),
            "print" | "p" => self.cmd_print(rest, board),
            "x" => self.cmd_examine(rest, board),
            "disasm" => self.cmd_disasm(rest, board),
            "info" => self.cmd_info(rest, board),
            _ => log_error("unknown command, try 'help' to see command list"),
        }
        false
    }

    fn cmd_break(&mut self, rest: &str, board: &Board) {
        let addr = if rest.is_empty() {
            board.core().pc()
        } else {
            match self.eval.eval(rest, board) {
                Ok(value) => value,
                Err(err) => return log_error(&err.to_string()),
            }
        };
        let id = self.next_point;
        self.next_point += 1;
        self.breakpoints.insert(id, addr);
        println!("breakpoint {id} at {addr:#010x}");
    }

    fn cmd_watch(&mut self, rest: &str, board: &Board) {
        if rest.is_empty() {
            return log_error("invalid 'EXPR', try 'help watch'");
        }
        let (value, record) = match self.eval.eval_recorded(rest, board) {
            Ok(result) => result,
            Err(err) => return log_error(&err.to_string()),
        };
        let id = self.next_point;
        self.next_point += 1;
        self.watchpoints.insert(id, Watchpoint { record, last: value });
        println!("watchpoint {id}: ${record} = {value}");
    }

    fn cmd_delete(&mut self, rest: &str) {
        if rest.is_empty() {
            print!("are you sure to delete all breakpoints & watchpoints? [y/n] ");
            let _ = io::stdout().flush();
            let mut answer = String::new();
            let _ = io::stdin().lock().read_line(&mut answer);
            if !answer.trim().eq_ignore_ascii_case("y") {
                return;
            }
            self.breakpoints.clear();
            self.watchpoints.clear();
            self.eval.clear_records();
            return;
        }
        let Ok(id) = rest.parse::<u32>() else {
            return log_error("invalid breakpoint/watchpoint id");
        };
        if self.breakpoints.remove(&id).is_some() {
            return;
        }
        match self.watchpoints.remove(&id) {
            Some(watch) => self.eval.remove_record(watch.record),
            None => log_error("invalid breakpoint/watchpoint id"),
        }
    }

    fn cmd_stepi(&mut self, rest: &str) -> bool {
        let count = if rest.is_empty() {
            1
        } else {
            match rest.parse::<u32>() {
                Ok(count) if count > 0 => count,
                _ => {
                    log_error("invalid step count");
                    return false;
                }
            }
        };
        self.step_count = Some(count);
        true
    }

    fn cmd_print(&mut self, rest: &str, board: &Board) {
        if rest.is_empty() {
            return log_error("invalid 'EXPR', try 'help print'");
        }
        match self.eval.eval_recorded(rest, board) {
            Ok((value, id)) => println!("${id} = {value}"),
            Err(err) => log_error(&err.to_string()),
        }
    }

    fn cmd_examine(&mut self, rest: &str, board: &Board) {
        let (count, expr) = match rest.split_once(char::is_whitespace) {
            Some((count, expr)) => (count, expr.trim()),
            None => (rest, ""),
        };
        let Ok(count) = count.parse::<u32>() else {
            return log_error("invalid count 'N', try 'help x'");
        };
        if count == 0 || expr.is_empty() {
            return log_error("invalid arguments, try 'help x'");
        }
        let mut addr = match self.eval.eval(expr, board) {
            Ok(value) => value,
            Err(err) => return log_error(&err.to_string()),
        };
        for _ in 0..count {
            let bytes: Vec<String> = (0..4)
                .map(|i| format!("{:02x}", board.bus().read_byte(addr.wrapping_add(i))))
                .collect();
            println!("{addr:08x}: {}", bytes.join(" "));
            addr = addr.wrapping_add(4);
        }
    }

    fn cmd_disasm(&mut self, rest: &str, board: &Board) {
        let (count, expr) = match rest.split_once(char::is_whitespace) {
            Some((count, expr)) => (count, expr.trim()),
            None => (rest, ""),
        };
        let count = if rest.is_empty() {
            1
        } else {
            match count.parse::<u32>() {
                Ok(count) if count > 0 => count,
                _ => return log_error("invalid count 'N', try 'help disasm'"),
            }
        };
        let mut addr = if expr.is_empty() {
            board.core().pc()
        } else {
            match self.eval.eval(expr, board) {
                Ok(value) => value,
                Err(err) => return log_error(&err.to_string()),
            }
        };
        for _ in 0..count {
            let word = board.bus().read_word(addr);
            println!("{addr:08x}: {word:08x}  {}", disasm::disassemble(word));
            addr = addr.wrapping_add(4);
        }
    }

    fn cmd_info(&mut self, rest: &str, board: &Board) {
        match rest {
            "reg" | "r" => self.print_registers(board),
            "csr" | "c" => self.print_csrs(board),
            "break" | "b" => {
                if self.breakpoints.is_empty() {
                    println!("no breakpoints currently set");
                    return;
                }
                println!("number of breakpoints: {}", self.breakpoints.len());
                for (id, addr) in &self.breakpoints {
                    println!("  breakpoint #{id}: pc = {addr:#010x}");
                }
            }
            "watch" | "w" => {
                if self.watchpoints.is_empty() {
                    println!("no watchpoints currently set");
                    return;
                }
                println!("number of watchpoints: {}", self.watchpoints.len());
                for (id, watch) in &self.watchpoints {
                    let text = self.eval.record_text(watch.record).unwrap_or("?");
                    println!(
                        "  watchpoint #{id}: ${} = ({text}), value = {}",
                        watch.record, watch.last
                    );
                }
            }
            _ => log_error("invalid 'ITEM', try 'help info'"),
        }
    }

    fn print_registers(&self, board: &Board) {
        // Four columns of name/value pairs: x1..x31 followed by pc.
        let values = (1..32)
            .map(|i| (GPR_NAMES[i], board.core().x(Specifier::new(i).unwrap())))
            .chain([("pc", board.core().pc())]);
        for (i, (name, value)) in values.enumerate() {
            print!("{name:<4}{value:08x}   ");
            if i % 4 == 3 {
                println!();
            }
        }
        println!();
    }

    fn print_csrs(&self, board: &Board) {
        for (i, name) in INFO_CSRS.into_iter().enumerate() {
            let address = names::csr_address(name).unwrap();
            let value = board.core().csr().read_force(address).unwrap_or(0);
            print!("{name:<10}{value:08x}   ");
            if i % 3 == 2 {
                println!();
            }
        }
        println!();
    }
}

fn log_error(msg: &str) {
    println!("ERROR: {msg}");
}

fn print_help(command: &str) {
    match command {
        "" => {
            println!("Debugger commands:");
            println!("  help      [CMD]      --- show help message of CMD");
            println!("  quit/q               --- quit program");
            println!("  break/b   [ADDR]     --- set breakpoint at ADDR");
            println!("  watch/w   EXPR       --- set watchpoint at EXPR");
            println!("  delete/d  [N]        --- delete breakpoint/watchpoint");
            println!("  continue/c           --- continue running");
            println!("  stepi/si  [N]        --- step by N instructions");
            println!("  print/p   EXPR       --- show value of EXPR");
            println!("  x         N EXPR     --- examine memory at EXPR");
            println!("  disasm    [N [ADDR]] --- disassemble at ADDR");
            println!("  info      ITEM       --- show information of ITEM");
        }
        "help" => {
            println!("Syntax: help [CMD]");
            println!("  Show a list of all debugger commands, or give details about a specific command.");
        }
        "quit" | "q" => {
            println!("Syntax: quit/q");
            println!("  Quit the emulator and debugger.");
        }
        "break" | "b" => {
            println!("Syntax: break/b [ADDR]");
            println!("  Set a breakpoint at specific address (PC), ADDR defaults to current PC.");
        }
        "watch" | "w" => {
            println!("Syntax: watch/w EXPR");
            println!("  Set a watchpoint for a specific expression, pause when EXPR changes.");
        }
        "delete" | "d" => {
            println!("Syntax: delete/d [N]");
            println!("  Delete breakpoint/watchpoint N, delete all breakpoints and watchpoints by default.");
        }
        "continue" | "c" => {
            println!("Syntax: continue/c");
            println!("  Continue running current program.");
        }
        "stepi" | "si" => {
            println!("Syntax: stepi/si [N]");
            println!("  Step by N instructions, N defaults to 1.");
        }
        "print" | "p" => {
            println!("Syntax: print/p EXPR");
            println!("  Show value of EXPR and record it as $n.");
        }
        "x" => {
            println!("Syntax: x N EXPR");
            println!("  Examine N units memory at address EXPR, 4 bytes per unit.");
        }
        "disasm" => {
            println!("Syntax: disasm [N [ADDR]]");
            println!("  Disassemble N instructions starting at ADDR, ADDR defaults to current PC.");
        }
        "info" => {
            println!("Syntax: info ITEM");
            println!("  Show information of ITEM.");
            println!();
            println!("ITEM:");
            println!("  reg/r   --- registers");
            println!("  csr/c   --- CSRs");
            println!("  break/b --- breakpoints");
            println!("  watch/w --- watchpoints");
        }
        _ => log_error("unknown command, try 'help' to see command list"),
    }
}
