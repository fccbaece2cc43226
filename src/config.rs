// The JSON machine configuration: an array of named entries, each naming the
// display geometry, the image files, the boot device and switches, memory
// sizing and the network binding. Numbers in boot switches use the Mesa
// conventions (trailing H or 0x for hex, trailing B or leading 0 for octal).

use crate::pilot::SWITCH_WORDS;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub name: String,
    pub display: Display,
    pub file: Files,
    pub boot: Boot,
    pub memory: MemorySize,
    pub network: Network,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Display {
    #[serde(rename = "type")]
    pub display_type: String,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Files {
    pub disk: String,
    pub germ: String,
    pub boot: String,
    pub floppy: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Boot {
    #[serde(rename = "switch")]
    pub switch: String,
    pub device: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemorySize {
    pub vmbits: u32,
    pub rmbits: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub interface: String,
    pub address: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Config> {
        let file = File::open(path).with_context(|| format!("cannot open config  path = {}", path))?;
        let config: Config =
            serde_json::from_reader(file).with_context(|| format!("cannot parse config  path = {}", path))?;
        Ok(config)
    }

    pub fn entry(&self, name: &str) -> Result<&Entry> {
        for entry in &self.entry {
            if entry.name == name {
                return Ok(entry);
            }
        }
        let known: Vec<&str> = self.entry.iter().map(|e| e.name.as_str()).collect();
        bail!("no such entry  name = {}  known = {:?}", name, known)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry.iter().any(|e| e.name == name)
    }
}

// Mesa number syntax: 0x1F and 1FH are hex, 17B and 017 are octal, anything
// else is decimal.
pub fn parse_mesa_number(text: &str) -> Result<u32> {
    let text = text.trim();
    if text.is_empty() {
        bail!("empty number");
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).with_context(|| format!("bad hex number  {}", text));
    }
    if let Some(hex) = text.strip_suffix('H').or_else(|| text.strip_suffix('h')) {
        return u32::from_str_radix(hex, 16).with_context(|| format!("bad hex number  {}", text));
    }
    if let Some(octal) = text.strip_suffix('B').or_else(|| text.strip_suffix('b')) {
        return u32::from_str_radix(octal, 8).with_context(|| format!("bad octal number  {}", text));
    }
    if text.len() > 1 && text.starts_with('0') {
        return u32::from_str_radix(&text[1..], 8).with_context(|| format!("bad octal number  {}", text));
    }
    text.parse().with_context(|| format!("bad decimal number  {}", text))
}

// Boot switches are a 512-bit set indexed by switch number, most significant
// bit of word zero first.
pub fn parse_switches(text: &str) -> Result<[u16; SWITCH_WORDS]> {
    let mut switches = [0u16; SWITCH_WORDS];
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value = parse_mesa_number(part)?;
        if (SWITCH_WORDS as u32 * 16) <= value {
            bail!("switch out of range  switch = {}", value);
        }
        switches[(value / 16) as usize] |= 0x8000 >> (value % 16);
    }
    Ok(switches)
}
