//! Interpreter for the instruction subset hook trampolines are built from.

use super::{PAGE_SIZE, Process};
use crate::target::{Address, TargetError, Tid};

/// Upper bound on instructions for one hooked call, so a corrupt trampoline can't spin forever.
const STEP_LIMIT: usize = 64;

fn fetch<const N: usize>(process: &Process, address: Address) -> Result<[u8; N], TargetError> {
    let region = process
        .region(address, N as u64)
        .ok_or(TargetError::Fault(address))?;
    let first_page = address - address % PAGE_SIZE;
    let mut page = first_page;
    while page < address + N as u64 {
        if !region.page_protection(page).executable() {
            return Err(TargetError::Fault(address));
        }
        page += PAGE_SIZE;
    }
    let mut bytes = [0u8; N];
    process.read(address, &mut bytes)?;
    Ok(bytes)
}

fn store(process: &mut Process, address: Address, data: &[u8]) -> Result<(), TargetError> {
    let region = process
        .region(address, data.len() as u64)
        .ok_or(TargetError::Fault(address))?;
    let end = address + data.len() as u64;
    let mut page = address - address % PAGE_SIZE;
    while page < end {
        if !region.page_protection(page).writable() {
            return Err(TargetError::Fault(address));
        }
        page += PAGE_SIZE;
    }
    process.write(address, data)
}

fn disp32(bytes: &[u8]) -> i64 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
}

fn qword(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn relative(next: Address, disp: i64) -> Address {
    next.wrapping_add_signed(disp)
}

/// Whether `address` starts with one of the two hook jump encodings.
pub(super) fn is_hook_jump(process: &Process, address: Address) -> bool {
    fetch::<1>(process, address).is_ok_and(|b| b[0] == 0xE9)
        || fetch::<6>(process, address).is_ok_and(|b| b == [0xFF, 0x25, 0, 0, 0, 0])
}

/// Runs from the hook jump at `entry` until control returns to `entry`.
/// Returns the trampoline address the jump led to.
pub(super) fn run_hooked_entry(
    process: &mut Process,
    tid: Tid,
    entry: Address,
) -> Result<Address, TargetError> {
    let mut rip = entry;
    let mut trampoline = None;
    let mut rax = process.threads.get(&tid).map_or(0, |t| t.rax);
    let mut stack = Vec::new();

    for _ in 0..STEP_LIMIT {
        let op = fetch::<2>(process, rip).or_else(|_| fetch::<1>(process, rip).map(|b| [b[0], 0]))?;
        let target = match op {
            [0xE9, _] => {
                let insn = fetch::<5>(process, rip)?;
                Some(relative(rip + 5, disp32(&insn[1..])))
            }
            [0xFF, 0x25] => {
                let insn = fetch::<6>(process, rip)?;
                let slot = relative(rip + 6, disp32(&insn[2..]));
                let mut pointer = [0u8; 8];
                process.read(slot, &mut pointer)?;
                Some(u64::from_le_bytes(pointer))
            }
            [0xC6, 0x05] => {
                let insn = fetch::<7>(process, rip)?;
                let next = rip + 7;
                store(process, relative(next, disp32(&insn[2..])), &insn[6..7])?;
                rip = next;
                None
            }
            [0xC7, 0x05] => {
                let insn = fetch::<10>(process, rip)?;
                let next = rip + 10;
                store(process, relative(next, disp32(&insn[2..])), &insn[6..10])?;
                rip = next;
                None
            }
            [0x50, _] => {
                stack.push(rax);
                rip += 1;
                None
            }
            [0x58, _] => {
                rax = stack.pop().ok_or(TargetError::Fault(rip))?;
                rip += 1;
                None
            }
            [0x48, 0xB8] => {
                let insn = fetch::<10>(process, rip)?;
                rax = qword(&insn[2..]);
                rip += 10;
                None
            }
            [0x48, 0xA3] => {
                let insn = fetch::<10>(process, rip)?;
                store(process, qword(&insn[2..]), &rax.to_le_bytes())?;
                rip += 10;
                None
            }
            _ => return Err(TargetError::Fault(rip)),
        };

        if let Some(target) = target {
            if target == entry {
                let thread = process.threads.entry(tid).or_default();
                thread.rip = entry;
                thread.rax = rax;
                return trampoline.ok_or(TargetError::Fault(rip));
            }
            trampoline.get_or_insert(target);
            rip = target;
        }
    }
    Err(TargetError::Fault(rip))
}
