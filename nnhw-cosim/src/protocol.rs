/// Control register offsets on the `saxi` port. Every register is 32 bits wide.
pub const REG_START: u32 = 0x00;
pub const REG_STATUS: u32 = 0x04;
/// Base of the scratch region; the design addresses intermediates relative to it.
pub const REG_GLOBAL_ADDR: u32 = 0x08;
/// Word where the design publishes its completion counter.
pub const REG_HANDSHAKE_ADDR: u32 = 0x0C;

/// Writing this to `REG_START` launches the design.
pub const START_STROBE: u32 = 0x1;

/// `REG_STATUS` bits.
pub const STATUS_BUSY: u32 = 1 << 0;
pub const STATUS_DONE: u32 = 1 << 1;

// ---------------------------------------------------------------------------
// Memory word helpers (all little-endian)
// ---------------------------------------------------------------------------

#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn write_u32_le(buf: &mut [u8], offset: usize, val: u32) -> Option<()> {
    buf.get_mut(offset..offset + 4)?
        .copy_from_slice(&val.to_le_bytes());
    Some(())
}

/// Return a human-readable name for a control register offset.
pub fn reg_name(reg: u32) -> &'static str {
    match reg {
        REG_START => "START",
        REG_STATUS => "STATUS",
        REG_GLOBAL_ADDR => "GLOBAL_ADDR",
        REG_HANDSHAKE_ADDR => "HANDSHAKE_ADDR",
        _ => "UNKNOWN",
    }
}
