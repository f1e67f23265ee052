//! # MI Instructions
//!
//! Memory-interface commands understood by every render engine generation.

/// Encode an MI command header from its opcode and low flag bits
#[inline]
pub const fn mi_instr(opcode: u32, flags: u32) -> u32 {
    (opcode << 23) | flags
}

/// No operation; pads the stream
pub const MI_NOOP: u32 = mi_instr(0x00, 0);

/// Ends the current batch and returns control to the ring
pub const MI_BATCH_BUFFER_END: u32 = mi_instr(0x0A, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings() {
        assert_eq!(MI_NOOP, 0);
        assert_eq!(MI_BATCH_BUFFER_END, 0x0500_0000);
    }
}
