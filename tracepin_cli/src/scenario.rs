use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use tracepin_core::Address;
use tracepin_core::sim::PAGE_SIZE;

/// `push rbp; mov rbp, rsp`, written at every function entry.
pub const ENTRY_PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xE5];
const FILLER: u8 = 0x90;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Instrumentation {
    Breakpoint,
    Hook,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepFilter {
    Executed,
    NotExecuted,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Function {
    pub address: Address,
    pub len: u32,
    #[serde(default = "default_instrumentation")]
    pub instrumentation: Instrumentation,
}

fn default_instrumentation() -> Instrumentation {
    Instrumentation::Hook
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Step {
    #[serde(default)]
    pub executed: Vec<Address>,
    pub filter: Option<StepFilter>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_pid")]
    pub pid: u32,
    #[serde(default, rename = "function")]
    pub functions: Vec<Function>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

fn default_pid() -> u32 {
    4242
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read scenario {path:?}: {e}"))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (i, f) in self.functions.iter().enumerate() {
            if f.len == 0 {
                anyhow::bail!("Function at {:#x} has zero length", f.address);
            }
            if self.functions[..i].iter().any(|g| g.address == f.address) {
                anyhow::bail!("Function at {:#x} listed twice", f.address);
            }
        }
        Ok(())
    }

    pub fn has_breakpoints(&self) -> bool {
        self.functions
            .iter()
            .any(|f| f.instrumentation == Instrumentation::Breakpoint)
    }

    /// Page-aligned `(base, size)` ranges covering every function, merged where they touch.
    pub fn code_ranges(&self) -> Vec<(Address, u64)> {
        let mut ranges: Vec<(Address, Address)> = self
            .functions
            .iter()
            .map(|f| {
                let start = f.address & !(PAGE_SIZE - 1);
                let end = (f.address + u64::from(f.len)).div_ceil(PAGE_SIZE) * PAGE_SIZE;
                (start, end)
            })
            .collect();
        ranges.sort_unstable();

        let mut merged: Vec<(Address, Address)> = Vec::new();
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
            .into_iter()
            .map(|(start, end)| (start, end - start))
            .collect()
    }

    /// Bytes for the range at `base`: filler with a prologue at each function entry.
    pub fn code_bytes(&self, base: Address, size: u64) -> Vec<u8> {
        let mut bytes = vec![FILLER; size as usize];
        for f in &self.functions {
            if f.address < base || f.address >= base + size {
                continue;
            }
            let offset = (f.address - base) as usize;
            let n = ENTRY_PROLOGUE
                .len()
                .min(f.len as usize)
                .min(bytes.len() - offset);
            bytes[offset..offset + n].copy_from_slice(&ENTRY_PROLOGUE[..n]);
        }
        bytes
    }

    /// Replaces the steps with `count` random ones over the scenario's functions.
    pub fn randomize_steps<R: Rng>(&mut self, rng: &mut R, count: usize) {
        self.steps = (0..count)
            .map(|_| Step {
                executed: self
                    .functions
                    .iter()
                    .filter(|_| rng.random_bool(0.5))
                    .map(|f| f.address)
                    .collect(),
                filter: match rng.random_range(0..3) {
                    0 => Some(StepFilter::Executed),
                    1 => Some(StepFilter::NotExecuted),
                    _ => None,
                },
            })
            .collect();
    }
}
