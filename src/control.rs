// The scripted control surface: named commands over the machine that return
// a string or dictionary result plus a status (0 ok, 1 bad command or
// argument). The interactive console binds the commands to stdin; any other
// transport can call execute() directly.

use crate::config::parse_mesa_number;
use crate::display;
use crate::guam::Machine;
use crate::memory::{Map, MapFlags};
use crate::pilot::*;
use std::fmt;
use std::io::{self, BufRead, Write};
use termion::color;

pub const STATUS_OK: i32 = 0;
pub const STATUS_INVALID: i32 = 1;

pub enum Value {
    Text(String),
    Dict(Vec<(String, String)>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => write!(f, "{}", text),
            Value::Dict(pairs) => {
                for (key, value) in pairs {
                    writeln!(f, "{:20} {}", key, value)?;
                }
                Ok(())
            }
        }
    }
}

pub struct Outcome {
    pub status: i32,
    pub result: Value,
}

fn ok(result: Value) -> Outcome {
    Outcome { status: STATUS_OK, result }
}
fn invalid(message: &str) -> Outcome {
    Outcome { status: STATUS_INVALID, result: Value::Text(message.to_string()) }
}

fn number(text: &str) -> Option<u32> {
    parse_mesa_number(text).ok()
}

pub fn execute(machine: &mut Machine, line: &str) -> Outcome {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some(command) => command,
        None => return invalid("empty command"),
    };
    let args: Vec<&str> = words.collect();

    match command {
        "boot" => cmd_boot(machine),
        "config" => cmd_config(machine),
        "display" => cmd_display(machine, &args),
        "event" => cmd_event(machine, &args),
        "log" => cmd_log(&args),
        "floppy" => cmd_floppy(machine),
        "memory" => cmd_memory(machine, &args),
        "perf" => cmd_perf(machine),
        "time" => cmd_time(machine),
        "variable" => cmd_variable(machine, &args),
        "trace" => cmd_trace(machine, &args),
        _ => invalid("unknown command"),
    }
}

fn cmd_boot(machine: &mut Machine) -> Outcome {
    match machine.boot() {
        Ok(()) => {
            machine.run();
            ok(Value::Text("stopped".to_string()))
        }
        Err(err) => invalid(&format!("boot failed: {}", err)),
    }
}

fn cmd_config(machine: &Machine) -> Outcome {
    let entry = &machine.entry;
    ok(Value::Dict(vec![
        ("name".to_string(), entry.name.clone()),
        ("display".to_string(), format!("{} {}x{}", entry.display.display_type, entry.display.width, entry.display.height)),
        ("disk".to_string(), entry.file.disk.clone()),
        ("germ".to_string(), entry.file.germ.clone()),
        ("boot".to_string(), entry.file.boot.clone()),
        ("floppy".to_string(), entry.file.floppy.clone()),
        ("switch".to_string(), entry.boot.switch.clone()),
        ("device".to_string(), entry.boot.device.clone()),
        ("vmbits".to_string(), entry.memory.vmbits.to_string()),
        ("rmbits".to_string(), entry.memory.rmbits.to_string()),
        ("interface".to_string(), entry.network.interface.clone()),
        ("address".to_string(), entry.network.address.clone()),
    ]))
}

fn cmd_display(machine: &mut Machine, args: &[&str]) -> Outcome {
    match args.first() {
        Some(&"set") => {
            let (width, height) = match (args.get(1).and_then(|a| number(a)), args.get(2).and_then(|a| number(a))) {
                (Some(width), Some(height)) => (width, height),
                _ => return invalid("display set <width> <height>"),
            };
            // Geometry is fixed once memory is laid out.
            if width == machine.memory.display_width() && height == machine.memory.display_height() {
                ok(Value::Text("unchanged".to_string()))
            } else {
                invalid("display geometry is fixed after build")
            }
        }
        Some(&"refresh") => {
            let width = machine.memory.display_width() as usize;
            let height = machine.memory.display_height() as usize;
            let mut buffer = vec![0u32; width * height];
            display::extract(&machine.memory, &mut buffer);
            let black = buffer.iter().filter(|&&p| p == display::PIXEL_BLACK).count();
            ok(Value::Dict(vec![
                ("width".to_string(), width.to_string()),
                ("height".to_string(), height.to_string()),
                ("black".to_string(), black.to_string()),
            ]))
        }
        Some(&"fill") => match args.get(1).and_then(|a| number(a)) {
            Some(pattern) => {
                display::fill(&machine.memory, pattern as u16);
                ok(Value::Text("filled".to_string()))
            }
            None => invalid("display fill <pattern>"),
        },
        _ => invalid("display set|refresh|fill"),
    }
}

fn cmd_event(machine: &mut Machine, args: &[&str]) -> Outcome {
    match args.first() {
        Some(&"motion") => {
            let (x, y) = match (args.get(1).and_then(|a| number(a)), args.get(2).and_then(|a| number(a))) {
                (Some(x), Some(y)) => (x as u16, y as u16),
                _ => return invalid("event motion <x> <y>"),
            };
            machine.mouse.set_position(&machine.memory, x, y);
            ok(Value::Text("moved".to_string()))
        }
        Some(&"keyPress") | Some(&"keyRelease") => {
            let scan_code = match args.get(1).and_then(|a| number(a)) {
                Some(code) => code as u16,
                None => return invalid("event keyPress|keyRelease <scanCode>"),
            };
            if args[0] == "keyPress" {
                machine.keyboard.key_press(&machine.memory, scan_code);
            } else {
                machine.keyboard.key_release(&machine.memory, scan_code);
            }
            ok(Value::Text("key".to_string()))
        }
        Some(&"buttonPress") | Some(&"buttonRelease") => {
            let button = match args.get(1).and_then(|a| number(a)) {
                Some(button) if button < 3 => button as u16,
                _ => return invalid("event buttonPress|buttonRelease <0..2>"),
            };
            // Mouse buttons sit past the keyboard keys in the bitmap.
            let scan_code = 96 + button;
            if args[0] == "buttonPress" {
                machine.keyboard.key_press(&machine.memory, scan_code);
            } else {
                machine.keyboard.key_release(&machine.memory, scan_code);
            }
            ok(Value::Text("button".to_string()))
        }
        _ => invalid("event motion|keyPress|keyRelease|buttonPress|buttonRelease"),
    }
}

// List every leader-page file on the configured floppy image.
fn cmd_floppy(machine: &Machine) -> Outcome {
    let path = &machine.entry.file.floppy;
    if path.is_empty() {
        return invalid("no floppy configured");
    }
    let disk = match crate::diskfile::DiskFile::attach(path) {
        Ok(disk) => std::sync::Arc::new(disk),
        Err(err) => return invalid(&format!("cannot attach floppy: {}", err)),
    };
    let mut text = String::new();
    for leader in crate::floppy::list_floppy(disk) {
        text.push_str(&format!("{}\n", leader));
    }
    ok(Value::Text(text.trim_end().to_string()))
}

fn cmd_log(args: &[&str]) -> Outcome {
    let level = match args.first() {
        Some(&"error") => log::Level::Error,
        Some(&"warn") => log::Level::Warn,
        Some(&"info") => log::Level::Info,
        Some(&"debug") => log::Level::Debug,
        Some(&"trace") => log::Level::Trace,
        _ => return invalid("log error|warn|info|debug|trace <text...>"),
    };
    let text = args[1..].join(" ");
    log::log!(level, "{}", text);
    ok(Value::Text("logged".to_string()))
}

fn cmd_memory(machine: &mut Machine, args: &[&str]) -> Outcome {
    match args.first() {
        Some(&"config") => ok(Value::Dict(vec![
            ("vpSize".to_string(), format!("{:X}", machine.memory.vp_size())),
            ("rpSize".to_string(), format!("{:X}", machine.memory.rp_size())),
            ("displayPageSize".to_string(), format!("{:X}", machine.memory.display_page_size())),
            ("displayRealPage".to_string(), format!("{:X}", machine.memory.display_real_page())),
        ])),
        Some(&"map") => match args.get(1).and_then(|a| number(a)) {
            Some(vp) if vp < machine.memory.vp_size() => {
                let map = machine.memory.read_map(vp);
                ok(Value::Dict(vec![
                    ("vp".to_string(), format!("{:06X}", vp)),
                    ("rp".to_string(), format!("{:06X}", map.rp)),
                    ("flags".to_string(), format!("{:o}", map.mf.0)),
                    ("vacant".to_string(), map.mf.is_vacant().to_string()),
                ]))
            }
            _ => invalid("memory map <vp>"),
        },
        Some(&"read") => {
            let va = match args.get(1).and_then(|a| number(a)) {
                Some(va) => va,
                None => return invalid("memory read <va> [count]"),
            };
            let count = args.get(2).and_then(|a| number(a)).unwrap_or(8).min(256);
            let limit = machine.memory.vp_size() * PAGE_SIZE;
            if va.checked_add(count).map_or(true, |end| limit < end) {
                return invalid("address out of range");
            }
            let mut text = String::new();
            for i in 0..count {
                if machine.memory.is_vacant(va + i) {
                    text.push_str("---- ");
                } else {
                    text.push_str(&format!("{:04X} ", machine.memory.read_word(va + i)));
                }
            }
            ok(Value::Text(text.trim_end().to_string()))
        }
        Some(&"vacant") => match args.get(1).and_then(|a| number(a)) {
            Some(va) if va < machine.memory.vp_size() * PAGE_SIZE => {
                ok(Value::Text(machine.memory.is_vacant(va).to_string()))
            }
            _ => invalid("memory vacant <va>"),
        },
        Some(&"write") => {
            // administrative poke, mirrors the map write path
            let (vp, rp, mf) = match (
                args.get(1).and_then(|a| number(a)),
                args.get(2).and_then(|a| number(a)),
                args.get(3).and_then(|a| number(a)),
            ) {
                (Some(vp), Some(rp), Some(mf)) => (vp, rp, mf),
                _ => return invalid("memory write <vp> <rp> <mf>"),
            };
            if machine.memory.vp_size() <= vp || machine.memory.rp_size() <= rp {
                return invalid("page out of range");
            }
            machine.processor.write_map_entry(vp, Map { mf: MapFlags(mf as u16), rp });
            ok(Value::Text("written".to_string()))
        }
        _ => invalid("memory config|map|read|vacant|write"),
    }
}

fn cmd_perf(machine: &Machine) -> Outcome {
    let mut pairs = vec![
        ("pageCache".to_string(), machine.processor.cache.stats()),
        ("cacheHit".to_string(), machine.processor.cache.hit.to_string()),
        ("cacheMissEmpty".to_string(), machine.processor.cache.miss_empty.to_string()),
        ("cacheMissConflict".to_string(), machine.processor.cache.miss_conflict.to_string()),
    ];
    let mop_total: u64 = machine.processor.opcodes.stats_mop.iter().sum();
    let esc_total: u64 = machine.processor.opcodes.stats_esc.iter().sum();
    pairs.push(("mopCount".to_string(), mop_total.to_string()));
    pairs.push(("escCount".to_string(), esc_total.to_string()));
    ok(Value::Dict(pairs))
}

fn cmd_time(machine: &Machine) -> Outcome {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    ok(Value::Dict(vec![
        ("elapsed".to_string(), machine.elapsed_seconds().to_string()),
        ("unixTime".to_string(), unix.to_string()),
        ("mesaTime".to_string(), to_mesa_time(unix).to_string()),
    ]))
}

fn cmd_variable(machine: &Machine, args: &[&str]) -> Outcome {
    let p = &machine.processor;
    match args.first() {
        None => ok(Value::Text(format!("{}", p))),
        Some(&name) => {
            let value = match name {
                "pc" => format!("{:04X}", p.pc),
                "sp" => format!("{}", p.sp),
                "psb" => format!("{:04X}", p.psb),
                "mds" => format!("{:08X}", p.mds),
                "lf" => format!("{:04X}", p.lf),
                "gf" => format!("{:08X}", p.gf),
                "cb" => format!("{:08X}", p.cb),
                "gfi" => format!("{:04X}", p.gfi),
                "wp" => format!("{:04X}", p.interrupts.wp()),
                "wdc" => format!("{:04X}", p.wdc),
                "ptc" => format!("{:04X}", p.ptc),
                "xts" => format!("{:04X}", p.xts),
                "mp" => format!("{:04}", p.mp()),
                _ => return invalid("unknown variable"),
            };
            ok(Value::Text(value))
        }
    }
}

fn cmd_trace(machine: &mut Machine, args: &[&str]) -> Outcome {
    match args.first() {
        Some(&"on") => {
            machine.processor.trace.set_enabled(true);
            ok(Value::Text("on".to_string()))
        }
        Some(&"off") => {
            machine.processor.trace.set_enabled(false);
            ok(Value::Text("off".to_string()))
        }
        other => {
            let count = match other {
                None => 16,
                Some(text) => match number(text) {
                    Some(count) => count as usize,
                    None => return invalid("trace [on|off|<count>]"),
                },
            };
            let mut text = String::new();
            for event in machine.processor.trace.recent(count) {
                text.push_str(&format!("{}\n", event));
            }
            text.push_str(&format!("total = {}", machine.processor.trace.total()));
            ok(Value::Text(text))
        }
    }
}

// The stdin binding: one command per line, colored status, EOF or "quit"
// ends the session.
pub fn console(machine: &mut Machine) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush().ok();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed == "quit" || trimmed == "exit" {
            break;
        }
        if !trimmed.is_empty() {
            let outcome = execute(machine, trimmed);
            if outcome.status == STATUS_OK {
                println!("{}", outcome.result);
            } else {
                println!(
                    "{}error:{} {}",
                    color::Fg(color::Red),
                    color::Fg(color::Reset),
                    outcome.result
                );
            }
        }
        print!("> ");
        stdout.flush().ok();
    }
}
