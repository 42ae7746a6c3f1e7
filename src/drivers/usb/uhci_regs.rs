//! UHCI Register Definitions using tock-registers
//!
//! The I/O-space registers are accessed through port I/O, so their bitfields
//! are used with [`LocalRegisterCopy`](tock_registers::LocalRegisterCopy)
//! values. The schedule descriptors live in DMA memory and use the 32-bit
//! bitfields below through `InMemoryRegister`, which gives every access to a
//! hardware-written word volatile semantics.
//!
//! # References
//! - Universal Host Controller Interface (UHCI) Design Guide, revision 1.1

use tock_registers::register_bitfields;

// ============================================================================
// I/O space register offsets
// ============================================================================

/// Offsets from the controller's I/O base (BAR 4)
pub mod offset {
    /// USB Command (u16)
    pub const USBCMD: u16 = 0x00;
    /// USB Status (u16)
    pub const USBSTS: u16 = 0x02;
    /// USB Interrupt Enable (u16)
    pub const USBINTR: u16 = 0x04;
    /// Frame Number (u16)
    pub const FRNUM: u16 = 0x06;
    /// Frame List Base Address (u32)
    pub const FRBASEADD: u16 = 0x08;
    /// Start Of Frame Modify (u8)
    pub const SOFMOD: u16 = 0x0C;
    /// First port status/control register, ports follow every 2 bytes (u16)
    pub const PORTSC_BASE: u16 = 0x10;
}

/// PCI configuration offset of the legacy support register (USBLEGSUP)
pub const PCI_LEGSUP: u8 = 0xC0;

/// USBLEGSUP value: PIRQ enabled, all legacy keyboard/mouse traps off
pub const PCI_LEGSUP_DEFAULT: u16 = 0xAF00;

// ============================================================================
// I/O space register bitfields
// ============================================================================

register_bitfields! [
    u16,
    /// USB Command (USBCMD) - offset 0x00
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Host Controller Reset
        HCRESET OFFSET(1) NUMBITS(1) [],
        /// Global Reset
        GRESET OFFSET(2) NUMBITS(1) [],
        /// Enter Global Suspend Mode
        EGSM OFFSET(3) NUMBITS(1) [],
        /// Force Global Resume
        FGR OFFSET(4) NUMBITS(1) [],
        /// Software Debug
        SWDBG OFFSET(5) NUMBITS(1) [],
        /// Configure Flag
        CF OFFSET(6) NUMBITS(1) [],
        /// Max Packet (0 = 32 bytes, 1 = 64 bytes)
        MAXP OFFSET(7) NUMBITS(1) []
    ],

    /// USB Status (USBSTS) - offset 0x02, write 1 to clear
    pub USBSTS [
        /// USB Interrupt (IOC or short packet)
        USBINT OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt
        ERROR_INT OFFSET(1) NUMBITS(1) [],
        /// Resume Detect
        RESUME_DETECT OFFSET(2) NUMBITS(1) [],
        /// Host System Error
        HOST_SYSTEM_ERROR OFFSET(3) NUMBITS(1) [],
        /// Host Controller Process Error
        PROCESS_ERROR OFFSET(4) NUMBITS(1) [],
        /// HC Halted
        HCHALTED OFFSET(5) NUMBITS(1) []
    ],

    /// USB Interrupt Enable (USBINTR) - offset 0x04
    pub USBINTR [
        TIMEOUT_CRC OFFSET(0) NUMBITS(1) [],
        RESUME OFFSET(1) NUMBITS(1) [],
        IOC OFFSET(2) NUMBITS(1) [],
        SHORT_PACKET OFFSET(3) NUMBITS(1) []
    ],

    /// Port Status and Control (PORTSC) - offset 0x10 + 2n
    pub PORTSC [
        /// Current Connect Status
        CCS OFFSET(0) NUMBITS(1) [],
        /// Connect Status Change (write 1 to clear)
        CSC OFFSET(1) NUMBITS(1) [],
        /// Port Enabled
        PE OFFSET(2) NUMBITS(1) [],
        /// Port Enable Change (write 1 to clear)
        PEC OFFSET(3) NUMBITS(1) [],
        /// Line Status (D+, D-)
        LINE_STATUS OFFSET(4) NUMBITS(2) [],
        /// Resume Detect
        RD OFFSET(6) NUMBITS(1) [],
        /// Reserved, always reads 1 on an implemented port
        RESERVED_ONE OFFSET(7) NUMBITS(1) [],
        /// Low Speed Device Attached
        LSDA OFFSET(8) NUMBITS(1) [],
        /// Port Reset
        PR OFFSET(9) NUMBITS(1) [],
        /// Suspend
        SUSP OFFSET(12) NUMBITS(1) []
    ]
];

// ============================================================================
// Schedule descriptor bitfields
// ============================================================================

register_bitfields! [
    u32,
    /// Link pointer (frame list entries, QH links, TD links)
    pub LINK [
        /// Terminate: no valid pointer
        TERMINATE OFFSET(0) NUMBITS(1) [],
        /// Pointer refers to a QH (1) or a TD (0)
        QH OFFSET(1) NUMBITS(1) [],
        /// Depth first: continue with the linked TD in the same frame
        DEPTH_FIRST OFFSET(2) NUMBITS(1) [],
        /// Physical address bits 31:4
        POINTER OFFSET(4) NUMBITS(28) []
    ],

    /// TD control and status
    pub TD_STATUS [
        /// Bytes transferred minus one (0x7FF = none)
        ACTUAL_LENGTH OFFSET(0) NUMBITS(11) [],
        /// Bit stuff error
        BITSTUFF OFFSET(17) NUMBITS(1) [],
        /// CRC error or timeout
        CRC_TIMEOUT OFFSET(18) NUMBITS(1) [],
        /// NAK received
        NAK OFFSET(19) NUMBITS(1) [],
        /// Babble detected
        BABBLE OFFSET(20) NUMBITS(1) [],
        /// Data buffer overrun/underrun
        DATA_BUFFER OFFSET(21) NUMBITS(1) [],
        /// Endpoint stalled
        STALLED OFFSET(22) NUMBITS(1) [],
        /// Controller still owns the TD
        ACTIVE OFFSET(23) NUMBITS(1) [],
        /// Interrupt on complete
        IOC OFFSET(24) NUMBITS(1) [],
        /// Isochronous select
        IOS OFFSET(25) NUMBITS(1) [],
        /// Low speed device
        LOW_SPEED OFFSET(26) NUMBITS(1) [],
        /// Error counter, decremented on each error
        ERROR_COUNT OFFSET(27) NUMBITS(2) [],
        /// Short packet detect
        SPD OFFSET(29) NUMBITS(1) []
    ],

    /// TD token
    pub TD_TOKEN [
        /// Packet identifier
        PID OFFSET(0) NUMBITS(8) [
            Setup = 0x2D,
            In = 0x69,
            Out = 0xE1
        ],
        DEVICE_ADDRESS OFFSET(8) NUMBITS(7) [],
        ENDPOINT OFFSET(15) NUMBITS(4) [],
        DATA_TOGGLE OFFSET(19) NUMBITS(1) [],
        /// Maximum length minus one (0x7FF = zero length)
        MAX_LENGTH OFFSET(21) NUMBITS(11) []
    ]
];

/// Encoding of a zero-byte length in ACTUAL_LENGTH / MAX_LENGTH
pub const NULL_LENGTH: u32 = 0x7FF;

/// Encode a byte count for the MAX_LENGTH / ACTUAL_LENGTH fields
pub const fn encode_length(len: usize) -> u32 {
    if len == 0 {
        NULL_LENGTH
    } else {
        (len as u32 - 1) & 0x7FF
    }
}

/// Decode a MAX_LENGTH / ACTUAL_LENGTH field into a byte count
pub const fn decode_length(field: u32) -> usize {
    ((field + 1) & 0x7FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tock_registers::LocalRegisterCopy;

    #[test]
    fn test_length_encoding() {
        assert_eq!(encode_length(0), 0x7FF);
        assert_eq!(encode_length(1), 0);
        assert_eq!(encode_length(64), 63);
        assert_eq!(decode_length(0x7FF), 0);
        assert_eq!(decode_length(0), 1);
        assert_eq!(decode_length(encode_length(1023)), 1023);
    }

    #[test]
    fn test_portsc_layout() {
        let portsc: LocalRegisterCopy<u16, PORTSC::Register> = LocalRegisterCopy::new(0x0185);
        assert!(portsc.is_set(PORTSC::CCS));
        assert!(portsc.is_set(PORTSC::PE));
        assert!(portsc.is_set(PORTSC::RESERVED_ONE));
        assert!(portsc.is_set(PORTSC::LSDA));
        assert!(!portsc.is_set(PORTSC::PR));
    }

    #[test]
    fn test_token_pid_values() {
        let mut token: LocalRegisterCopy<u32, TD_TOKEN::Register> = LocalRegisterCopy::new(0);
        token.modify(TD_TOKEN::PID::In + TD_TOKEN::ENDPOINT.val(2));
        assert_eq!(token.get() & 0xFF, 0x69);
        assert_eq!(token.read(TD_TOKEN::ENDPOINT), 2);
    }
}
