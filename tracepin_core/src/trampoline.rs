//! x86-64 inline-hook synthesis.
//!
//! A hook replaces the first bytes of a function with a jump into a trampoline.
//! The trampoline marks its hit byte, writes the original prologue back over
//! the jump and jumps to the now-restored entry, so every hook fires at most
//! once per arming.
//!
//! Two forms exist. The near form uses `rel32` addressing throughout and needs
//! the trampoline within ±2 GiB of the entry; the far form uses absolute
//! 64-bit addressing and works anywhere. [`synthesize`] is pure: it only
//! builds bytes, the caller writes them.

use crate::target::Address;

/// Largest displacement a `rel32` jump can cover.
pub const NEAR_DISTANCE: u64 = 0x7FFF_FFFF;

pub const JUMP_REL32_LEN: usize = 5;
pub const JUMP_ABS64_LEN: usize = 14;
pub const JUMP_MAX_LEN: usize = JUMP_ABS64_LEN;

pub const TRAMPOLINE_REL32_LEN: usize = 30;
pub const TRAMPOLINE_ABS64_LEN: usize = 64;
pub const TRAMPOLINE_MAX_LEN: usize = TRAMPOLINE_ABS64_LEN;

/// Distance below which the near form is used. The margin keeps every
/// `rel32` inside the trampoline in range too.
pub const NEAR_THRESHOLD: u64 = NEAR_DISTANCE - TRAMPOLINE_MAX_LEN as u64;

/// Prologue bytes captured before hooking. The far form restores them with two
/// 8-byte stores, so it needs two bytes past its jump.
pub const PROLOGUE_SNAPSHOT_LEN: usize = 16;

const HIT_OFFSET_REL32: usize = 0x1D;
const HIT_OFFSET_ABS64: usize = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Form {
    Near,
    Far,
}

impl Form {
    /// Picks the form from the signed distance `trampoline - entry`.
    pub fn for_distance(distance: i128) -> Form {
        if distance.unsigned_abs() < NEAR_THRESHOLD as u128 {
            Form::Near
        } else {
            Form::Far
        }
    }

    pub fn select(entry: Address, trampoline: Address) -> Form {
        Form::for_distance(trampoline as i128 - entry as i128)
    }

    /// Bytes overwritten at the function entry.
    pub fn jump_len(self) -> usize {
        match self {
            Form::Near => JUMP_REL32_LEN,
            Form::Far => JUMP_ABS64_LEN,
        }
    }

    pub fn trampoline_len(self) -> usize {
        match self {
            Form::Near => TRAMPOLINE_REL32_LEN,
            Form::Far => TRAMPOLINE_ABS64_LEN,
        }
    }

    pub fn hit_offset(self) -> usize {
        match self {
            Form::Near => HIT_OFFSET_REL32,
            Form::Far => HIT_OFFSET_ABS64,
        }
    }
}

/// A synthesized hook, ready to be written into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trampoline {
    pub form: Form,
    pub entry: Address,
    pub address: Address,
    /// Trampoline body, written at `address`.
    pub code: Vec<u8>,
    /// Jump written over the prologue at `entry` whenever the hook is armed.
    pub jump: Vec<u8>,
    /// The prologue bytes the jump replaces.
    pub replaced: Vec<u8>,
    /// Offset of the hit byte from `address`.
    pub hit_offset: usize,
}

impl Trampoline {
    pub fn hit_address(&self) -> Address {
        self.address + self.hit_offset as Address
    }
}

/// `rel32` from the end of an instruction (`next`) to `target`.
fn rel32(next: Address, target: Address) -> [u8; 4] {
    (target.wrapping_sub(next) as i64 as i32).to_le_bytes()
}

/// Builds the jump and trampoline for hooking `entry` with a trampoline at `address`.
pub fn synthesize(
    entry: Address,
    address: Address,
    prologue: &[u8; PROLOGUE_SNAPSHOT_LEN],
) -> Trampoline {
    match Form::select(entry, address) {
        Form::Near => synthesize_near(entry, address, prologue),
        Form::Far => synthesize_far(entry, address, prologue),
    }
}

fn synthesize_near(
    entry: Address,
    address: Address,
    prologue: &[u8; PROLOGUE_SNAPSHOT_LEN],
) -> Trampoline {
    let hit = address + HIT_OFFSET_REL32 as Address;

    // jmp rel32
    let mut jump = Vec::with_capacity(JUMP_REL32_LEN);
    jump.push(0xE9);
    jump.extend_from_slice(&rel32(entry + JUMP_REL32_LEN as Address, address));

    let mut code = Vec::with_capacity(TRAMPOLINE_REL32_LEN);
    // 0x00: mov byte [rip+hit], 1
    code.extend_from_slice(&[0xC6, 0x05]);
    code.extend_from_slice(&rel32(address + 0x07, hit));
    code.push(0x01);
    // 0x07: mov dword [rip+entry], prologue[0..4]
    code.extend_from_slice(&[0xC7, 0x05]);
    code.extend_from_slice(&rel32(address + 0x11, entry));
    code.extend_from_slice(&prologue[0..4]);
    // 0x11: mov byte [rip+entry+4], prologue[4]
    code.extend_from_slice(&[0xC6, 0x05]);
    code.extend_from_slice(&rel32(address + 0x18, entry + 4));
    code.push(prologue[4]);
    // 0x18: jmp entry
    code.push(0xE9);
    code.extend_from_slice(&rel32(address + 0x1D, entry));
    // 0x1D: hit byte
    code.push(0x00);
    debug_assert_eq!(code.len(), TRAMPOLINE_REL32_LEN);

    Trampoline {
        form: Form::Near,
        entry,
        address,
        code,
        jump,
        replaced: prologue[..JUMP_REL32_LEN].to_vec(),
        hit_offset: HIT_OFFSET_REL32,
    }
}

fn synthesize_far(
    entry: Address,
    address: Address,
    prologue: &[u8; PROLOGUE_SNAPSHOT_LEN],
) -> Trampoline {
    let hit = address + HIT_OFFSET_ABS64 as Address;

    // jmp [rip+0]; dq address
    let mut jump = Vec::with_capacity(JUMP_ABS64_LEN);
    jump.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    jump.extend_from_slice(&address.to_le_bytes());

    let mut code = Vec::with_capacity(TRAMPOLINE_ABS64_LEN);
    // 0x00: mov byte [rip+hit], 1
    code.extend_from_slice(&[0xC6, 0x05]);
    code.extend_from_slice(&rel32(address + 0x07, hit));
    code.push(0x01);
    // 0x07: push rax
    code.push(0x50);
    // 0x08: movabs rax, prologue[0..8]
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&prologue[0..8]);
    // 0x12: movabs [entry], rax
    code.extend_from_slice(&[0x48, 0xA3]);
    code.extend_from_slice(&entry.to_le_bytes());
    // 0x1C: movabs rax, prologue[8..16]
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&prologue[8..16]);
    // 0x26: movabs [entry+8], rax
    code.extend_from_slice(&[0x48, 0xA3]);
    code.extend_from_slice(&(entry + 8).to_le_bytes());
    // 0x30: pop rax
    code.push(0x58);
    // 0x31: jmp [rip+0]; dq entry
    code.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&entry.to_le_bytes());
    // 0x3F: hit byte
    code.push(0x00);
    debug_assert_eq!(code.len(), TRAMPOLINE_ABS64_LEN);

    Trampoline {
        form: Form::Far,
        entry,
        address,
        code,
        jump,
        replaced: prologue[..JUMP_ABS64_LEN].to_vec(),
        hit_offset: HIT_OFFSET_ABS64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROLOGUE: [u8; PROLOGUE_SNAPSHOT_LEN] = [
        0x48, 0x89, 0x5C, 0x24, 0x08, 0x57, 0x48, 0x83, 0xEC, 0x20, 0x8B, 0xD9, 0x33, 0xC0, 0x90,
        0xC3,
    ];

    fn read_i32(bytes: &[u8], at: usize) -> i64 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as i64
    }

    fn read_u64(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn form_flips_at_threshold() {
        let t = NEAR_THRESHOLD as i128;
        assert_eq!(Form::for_distance(0), Form::Near);
        assert_eq!(Form::for_distance(t - 1), Form::Near);
        assert_eq!(Form::for_distance(-(t - 1)), Form::Near);
        assert_eq!(Form::for_distance(t), Form::Far);
        assert_eq!(Form::for_distance(-t), Form::Far);
        assert_eq!(Form::for_distance(i64::MAX as i128), Form::Far);
    }

    #[test]
    fn select_uses_signed_distance_both_ways() {
        let entry = 0x7FF6_0000_1000;
        assert_eq!(Form::select(entry, entry + 0x1000), Form::Near);
        assert_eq!(Form::select(entry, entry - 0x1000), Form::Near);
        assert_eq!(Form::select(entry, entry + NEAR_THRESHOLD), Form::Far);
        assert_eq!(Form::select(entry, entry - NEAR_THRESHOLD), Form::Far);
        assert_eq!(Form::select(entry, 0x10000), Form::Far);
    }

    #[test]
    fn near_form_layout() {
        let entry: Address = 0x1_4000_1000;
        let address: Address = 0x1_3FFF_0000;
        let t = synthesize(entry, address, &PROLOGUE);

        assert_eq!(t.form, Form::Near);
        assert_eq!(t.code.len(), TRAMPOLINE_REL32_LEN);
        assert_eq!(t.hit_offset, 0x1D);
        assert_eq!(t.hit_address(), address + 0x1D);
        assert_eq!(t.replaced, PROLOGUE[..5].to_vec());

        assert_eq!(t.jump[0], 0xE9);
        assert_eq!(entry as i64 + 5 + read_i32(&t.jump, 1), address as i64);

        let c = &t.code;
        assert_eq!(&c[0x00..0x02], &[0xC6, 0x05]);
        assert_eq!(address as i64 + 0x07 + read_i32(c, 0x02), (address + 0x1D) as i64);
        assert_eq!(c[0x06], 0x01);
        assert_eq!(&c[0x07..0x09], &[0xC7, 0x05]);
        assert_eq!(address as i64 + 0x11 + read_i32(c, 0x09), entry as i64);
        assert_eq!(&c[0x0D..0x11], &PROLOGUE[0..4]);
        assert_eq!(&c[0x11..0x13], &[0xC6, 0x05]);
        assert_eq!(address as i64 + 0x18 + read_i32(c, 0x13), (entry + 4) as i64);
        assert_eq!(c[0x17], PROLOGUE[4]);
        assert_eq!(c[0x18], 0xE9);
        assert_eq!(address as i64 + 0x1D + read_i32(c, 0x19), entry as i64);
        assert_eq!(c[0x1D], 0x00);
    }

    #[test]
    fn far_form_layout() {
        let entry: Address = 0x7FF6_1234_0000;
        let address: Address = 0x0000_0000_0002_0000;
        let t = synthesize(entry, address, &PROLOGUE);

        assert_eq!(t.form, Form::Far);
        assert_eq!(t.code.len(), TRAMPOLINE_ABS64_LEN);
        assert_eq!(t.hit_offset, 0x3F);
        assert_eq!(t.replaced, PROLOGUE[..14].to_vec());

        assert_eq!(&t.jump[0..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(read_u64(&t.jump, 6), address);

        let c = &t.code;
        assert_eq!(address as i64 + 0x07 + read_i32(c, 0x02), (address + 0x3F) as i64);
        assert_eq!(c[0x07], 0x50);
        assert_eq!(&c[0x08..0x0A], &[0x48, 0xB8]);
        assert_eq!(&c[0x0A..0x12], &PROLOGUE[0..8]);
        assert_eq!(&c[0x12..0x14], &[0x48, 0xA3]);
        assert_eq!(read_u64(c, 0x14), entry);
        assert_eq!(&c[0x1E..0x26], &PROLOGUE[8..16]);
        assert_eq!(read_u64(c, 0x28), entry + 8);
        assert_eq!(c[0x30], 0x58);
        assert_eq!(&c[0x31..0x37], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(read_u64(c, 0x37), entry);
        assert_eq!(c[0x3F], 0x00);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let a = synthesize(0x40_1000, 0x41_0000, &PROLOGUE);
        let b = synthesize(0x40_1000, 0x41_0000, &PROLOGUE);
        assert_eq!(a, b);
    }
}
