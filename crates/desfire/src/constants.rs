//! Constants used by the DESFire session engine
//!
//! Instruction codes are only the ones that participate in cryptogram
//! construction; command framing proper lives with the command layer.

/// DESFire instruction codes
pub mod ins {
    /// Legacy AUTHENTICATE command
    pub const AUTHENTICATE: u8 = 0x0A;
    /// ISO AUTHENTICATE command (EV1)
    pub const AUTHENTICATE_ISO: u8 = 0x1A;
    /// AES AUTHENTICATE command (EV1)
    pub const AUTHENTICATE_AES: u8 = 0xAA;
    /// AuthenticateEV2First command
    pub const AUTHENTICATE_EV2_FIRST: u8 = 0x71;
    /// CHANGE KEY command
    pub const CHANGE_KEY: u8 = 0xC4;
    /// ChangeKeyEV2 command (targets a specific keyset)
    pub const CHANGE_KEY_EV2: u8 = 0xC6;
}

/// Status byte appended to MACed response payloads
pub const SW_OPERATION_OK: u8 = 0x00;

/// Label prefixes for the EV2 session vectors SV1/SV2
pub mod sv_label {
    /// SV1 prefix (encryption session key)
    pub const SV1: [u8; 6] = [0xA5, 0x5A, 0x00, 0x01, 0x00, 0x80];
    /// SV2 prefix (MAC session key)
    pub const SV2: [u8; 6] = [0x5A, 0xA5, 0x00, 0x01, 0x00, 0x80];
}

/// Direction labels mixed into the EV2 encryption IV
pub mod iv_label {
    /// Command direction (PCD to PICC)
    pub const COMMAND: [u8; 2] = [0xA5, 0x5A];
    /// Response direction (PICC to PCD)
    pub const RESPONSE: [u8; 2] = [0x5A, 0xA5];
}
