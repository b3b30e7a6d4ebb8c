//! # PCI Constants
//!
//! This module collects PCI related constants. All definitions are derived from the PCI
//! Spec, either the "PCI Local Bus Specification" or newer "PCI Express Base Specification"
//! documents.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// The maximum number of busses on a PCI segment.
pub const MAX_BUSES: usize = 256;

/// The maximum number of devices on a PCI bus.
pub const MAX_BUS_DEVICES: usize = 32;

/// The maximum number of functions in a PCI device.
pub const MAX_DEVICE_FUNCTIONS: usize = 8;

/// The maximum number of devices on a PCI segment.
pub const MAX_DEVICES: usize = MAX_BUSES * MAX_BUS_DEVICES * MAX_DEVICE_FUNCTIONS;

/// Constants related to the configuration space.
pub mod config_space {

    /// The config space size of a single PCI device in bytes.
    pub const SIZE: usize = 256;

    /// The maximum number of Base Address Registers (BARs) per device.
    pub const MAX_BARS: usize = 6;

    /// The size in bytes of a single BAR.
    pub const BAR_ENTRY_SIZE: usize = 4;

    /// Masks for various configuration space fields.
    pub mod mask {
        pub const CAPABILITIES_POINTER: u8 = 0xfc;
        pub const PIO_BAR_MARKER: u64 = 0x1;
        pub const PIO_BAR_ADDRESS: u64 = 0xffff_fffc;
        pub const MMIO_BAR_TYPE: u64 = 0x6;
        pub const MMIO_BAR_64_BIT: u64 = 0x4;
        pub const MMIO_BAR_ADDRESS: u64 = 0xffff_fff0;
    }

    /// The offsets of various fields in the configuration space.
    pub mod offset {
        pub const VENDOR: usize = 0x0;
        pub const DEVICE: usize = 0x2;
        pub const COMMAND: usize = 0x4;
        pub const STATUS: usize = 0x6;
        pub const REVISION: usize = 0x8;
        pub const PROG_IF: usize = 0x9;
        pub const SUBCLASS: usize = 0xA;
        pub const CLASS: usize = 0xB;
        pub const CACHE_LINE_SIZE: usize = 0xC;
        pub const LATENCY_TIMER: usize = 0xD;
        pub const HEADER_TYPE: usize = 0xE;
        pub const BIST: usize = 0xF;

        pub const BAR_0: usize = 0x10;
        pub const BAR_1: usize = 0x14;
        pub const BAR_2: usize = 0x18;
        pub const BAR_3: usize = 0x1C;
        pub const BAR_4: usize = 0x20;
        pub const BAR_5: usize = 0x24;

        pub const SUBSYSTEM_VENDOR_ID: usize = 0x2C;
        pub const SUBSYSTEM_ID: usize = 0x2E;
        pub const ROM_BAR: usize = 0x30;
        pub const CAPABILITIES_POINTER: usize = 0x34;
        pub const IRQ_LINE: usize = 0x3C;
        pub const IRQ_PIN: usize = 0x3D;
        pub const MIN_GNT: usize = 0x3E;
        pub const MAX_LAT: usize = 0x3F;
    }

    /// The device vendor.
    pub mod vendor {
        pub const INVALID: u16 = 0xFFFF;
        pub const INTEL: u16 = 0x8086;
        pub const REDHAT: u16 = 0x1b36;
        pub const VIRTIO: u16 = 0x1AF4;
    }

    pub mod device {
        pub const INVALID: u16 = 0xFFFF;
        pub const I440FX_HOST_BRIDGE: u16 = 0x1237;
        pub const PIIX4_ISA_BRIDGE: u16 = 0x7110;
        pub const PIIX4_PM_DEVICE: u16 = 0x7113;
        pub const REDHAT_XHCI: u16 = 0x000d;

        /// Virtio devices occupy a range of device IDs.
        ///
        /// The concrete device ID is computed by adding the virtio-specific type ID to this value.
        pub const VIRTIO_DEVICE: u16 = 0x1040;
    }

    /// Command Register Constants.
    pub mod command {
        pub const WRITABLE_BITS: u16 = 0x077F;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// PCI class constants.
    pub mod class {
        pub const BRIDGE: u8 = 0x6;
        pub const SERIAL: u8 = 0xc;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI sub-class constants.
    pub mod subclass {
        pub const HOST_BRIDGE: u8 = 0x0;
        pub const PCI_TO_ISA_BRIDGE: u8 = 0x1;
        pub const OTHER_BRIDGE: u8 = 0x80;
        pub const SERIAL_USB: u8 = 0x03;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI programming interface constants.
    pub mod progif {
        pub const USB_XHCI: u8 = 0x30;
    }

    /// PCI header type.
    ///
    /// This is usually type 0, except for PCI-to-PCI bridges and other exotic devices such as
    /// Cardbus bridges.
    pub mod header_type {
        pub const TYPE_00: u8 = 0;
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const MSI: u8 = 0x05;
        pub const VENDOR_SPECIFIC: u8 = 0x09;
        pub const MSI_X: u8 = 0x11;
    }

    /// Markers for iterating the list of capabilities.
    pub mod capability_list {
        pub const END_OF_LIST: u8 = 0;
    }

    /// Constants for the MSI capability.
    pub mod msi {
        /// Size of the capability in bytes.
        pub const SIZE: usize = 16;

        /// The offset of the message control register.
        pub const CONTROL: u64 = 2;
        /// The offset of the lower address part.
        pub const ADDRESS_LOW: u64 = 4;
        /// The offset of the high address part of a 64 bit address.
        pub const ADDRESS_HIGH: u64 = 8;
        /// The offset of the data field.
        pub const DATA: u64 = 12;

        /// Constants for the Control field.
        pub mod control {
            pub const ENABLE: u16 = 1 << 0;
        }
    }

    /// Constants for the MSI-X capability.
    pub mod msix {
        /// The size of the MSI-X capability.
        pub const SIZE: usize = 12;

        /// The maximum number of MSI-X vectors.
        ///
        /// Note that the table size field in the [`control`] register contains the _last valid
        /// index_, not the maximum number.
        pub const MAX_VECTORS: u16 = 0x800;

        /// The offset of the message control register.
        pub const CONTROL: u64 = 2;
        /// The offset for MSI-X Table Offset and BAR indicator.
        pub const TABLE_INFO: u64 = 4;
        /// The offset for MSI-X Pending Bit Array Offset and BAR indicator.
        pub const PBA_INFO: u64 = 8;

        /// Masks of the table info field.
        pub mod table_info {
            pub const REGION: u8 = 0b111;
            pub const OFFSET: u32 = !0b111;
        }

        /// Constants for the Control field.
        pub mod control {
            pub const ENABLE: u16 = 1 << 15;
            pub const FUNCTION_MASK: u16 = 1 << 14;

            pub const WRITABLE_BITS: u16 = ENABLE | FUNCTION_MASK;
        }
    }
}

/// Constants related to the XHCI MMIO space.
pub mod xhci {

    /// Value for the operational base as returned for reading CAPLENGTH.
    pub const OP_BASE: u64 = 0x68;
    /// Runtime register base offset.
    pub const RUN_BASE: u64 = 0x3000;

    /// Number of device slots we report and manage.
    ///
    /// One slot per physically attachable device keeps the `DeviceSlotManager`
    /// and the per-slot host structures simple fixed-size arrays.
    pub const MAX_SLOTS: u64 = 16;

    /// Number of root hub ports we expose, split evenly between USB3 and USB2.
    pub const NUM_USB3_PORTS: u64 = 4;
    pub const NUM_USB2_PORTS: u64 = 4;
    pub const MAX_PORTS: u64 = NUM_USB3_PORTS + NUM_USB2_PORTS;

    /// Number of interrupters the physical controller has. The last one is
    /// reserved for our own bookkeeping and never reported to the guest.
    pub const PHYSICAL_MAX_INTRS: u64 = 2;
    pub const MAX_INTRS: u64 = PHYSICAL_MAX_INTRS - 1;

    /// Offsets of various fields from the start of the XHCI MMIO region.
    pub mod offset {
        /// Capability Register Offsets
        pub const CAPLENGTH: u64 = 0x0;
        pub const HCIVERSION: u64 = 0x2;
        pub const HCSPARAMS1: u64 = 0x4;
        pub const HCSPARAMS2: u64 = 0x8;
        pub const HCSPARAMS3: u64 = 0xc;
        pub const HCCPARAMS1: u64 = 0x10;
        pub const DBOFF: u64 = 0x14;
        pub const RTSOFF: u64 = 0x18;
        pub const HCCPARAMS2: u64 = 0x1c;

        /// Extended Capabilities: "Supported Protocol Capability", one entry
        /// for USB3 and one for USB2, placed right after the capability
        /// registers.
        pub const SUPPORTED_PROTOCOLS: u64 = 0x20;
        pub const SUPPORTED_PROTOCOLS_CONFIG: u64 = SUPPORTED_PROTOCOLS + 0x8;
        pub const SUPPORTED_PROTOCOLS_USB2: u64 = SUPPORTED_PROTOCOLS + 0x10;
        pub const SUPPORTED_PROTOCOLS_USB2_CONFIG: u64 = SUPPORTED_PROTOCOLS_USB2 + 0x8;

        /// Operational Register Offsets
        pub const USBCMD: u64 = super::OP_BASE;
        pub const USBSTS: u64 = super::OP_BASE + 0x4;
        pub const PAGESIZE: u64 = super::OP_BASE + 0x8;
        pub const DNCTL: u64 = super::OP_BASE + 0x14;
        pub const CRCR: u64 = super::OP_BASE + 0x18;
        pub const CRCR_HI: u64 = super::OP_BASE + 0x1c;
        pub const DCBAAP: u64 = super::OP_BASE + 0x30;
        pub const DCBAAP_HI: u64 = super::OP_BASE + 0x34;
        pub const CONFIG: u64 = super::OP_BASE + 0x38;

        /// Stride and base of the PORTSC register set.
        pub const PORT_STRIDE: u64 = 0x10;
        pub const PORTSC: u64 = super::OP_BASE + 0x400;

        /// Runtime Register Offsets (single, guest-visible interrupter; the
        /// second, hidden interrupter used internally lives past
        /// `RUN_BASE + INTERRUPTER_STRIDE` and is never matched by these
        /// offsets).
        pub const INTERRUPTER_STRIDE: u64 = 0x20;
        pub const IMAN: u64 = super::RUN_BASE + 0x20;
        pub const IMOD: u64 = super::RUN_BASE + 0x24;
        pub const ERSTSZ: u64 = super::RUN_BASE + 0x28;
        pub const ERSTBA: u64 = super::RUN_BASE + 0x30;
        pub const ERSTBA_HI: u64 = super::RUN_BASE + 0x34;
        pub const ERDP: u64 = super::RUN_BASE + 0x38;
        pub const ERDP_HI: u64 = super::RUN_BASE + 0x3c;

        /// Doorbell Register Offsets.
        ///
        /// Doorbell 0 is the command ring doorbell; doorbells
        /// `1..=MAX_SLOTS` target device endpoints.
        pub const DOORBELL_BASE: u64 = 0x2000;
        pub const DOORBELL_CONTROLLER: u64 = DOORBELL_BASE;
        pub const DOORBELL_DEVICE: u64 = DOORBELL_BASE + 0x4;
        pub const DOORBELL_DEVICE_END: u64 = DOORBELL_BASE + 0x4 * (super::MAX_SLOTS + 1);
    }

    /// Constants for the capability registers.
    pub mod capability {
        /// bcdVersion: 1.10, matching the fields we emulate.
        pub const HCIVERSION: u64 = 0x0110;

        /// HCSPARAMS1: MaxSlots (bits 0-7), MaxIntrs (bits 8-18), MaxPorts (bits 24-31).
        pub const HCSPARAMS1: u64 =
            super::MAX_SLOTS | (super::MAX_INTRS << 8) | (super::MAX_PORTS << 24);

        /// HCSPARAMS2: no scratchpad buffers advertised (IST=0, ERST Max=0).
        pub const HCSPARAMS2: u64 = 0;

        /// HCCPARAMS1: AC64=0 (32-bit contexts only), Max Primary Stream
        /// Array Size=0, xECP points at our Supported Protocol Capability.
        pub const HCCPARAMS1: u64 = (super::offset::SUPPORTED_PROTOCOLS / 4) << 16;

        /// "Supported Protocol Capability" entries (xHCI 1.1 §7.2).
        pub mod supported_protocols {
            /// Capability ID 2 ("Supported Protocol"), Major Revision 3 (USB3).
            pub const CAP_INFO: u64 = 0x03_00_00_02;
            /// Compatible Port Offset=1, Compatible Port Count=NUM_USB3_PORTS.
            pub const CONFIG: u64 = 1 | (super::super::NUM_USB3_PORTS << 8);
        }

        pub mod supported_protocols_usb2 {
            /// Capability ID 2 ("Supported Protocol"), Major Revision 2 (USB2).
            pub const CAP_INFO: u64 = 0x02_00_00_02;
            /// Compatible Port Offset=NUM_USB3_PORTS+1, Compatible Port Count=NUM_USB2_PORTS.
            pub const CONFIG: u64 =
                (super::super::NUM_USB3_PORTS + 1) | (super::super::NUM_USB2_PORTS << 8);
        }
    }

    /// Constants for the operational registers.
    pub mod operational {
        /// USBCMD bits.
        pub mod usbcmd {
            pub const RUN_STOP: u64 = 1 << 0;
            pub const HCRST: u64 = 1 << 1;
            pub const INTE: u64 = 1 << 2;
        }

        /// USBSTS bits.
        pub mod usbsts {
            pub const HCH: u64 = 1 << 0;
            pub const HSE: u64 = 1 << 2;
            pub const EINT: u64 = 1 << 3;
            pub const PCD: u64 = 1 << 4;
            pub const SSS: u64 = 1 << 8;
            pub const RSS: u64 = 1 << 9;
            pub const SRE: u64 = 1 << 10;
            pub const CNR: u64 = 1 << 11;
            pub const HCE: u64 = 1 << 12;

            /// Bits whose presence triggers a full controller reset (§4.7).
            pub const RESET_TRIGGERS: u64 = HSE | SRE | HCE;
        }

        /// CRCR bits.
        pub mod crcr {
            pub const RCS: u64 = 1 << 0;
            pub const CS: u64 = 1 << 1;
            pub const CA: u64 = 1 << 2;
            pub const CRR: u64 = 1 << 3;
            pub const DEQUEUE_POINTER_MASK: u64 = !0x3f;
        }

        /// ERDP bits.
        pub mod erdp {
            pub const EHB: u64 = 1 << 3;
            pub const DEQUEUE_POINTER_MASK: u64 = !0xf;
        }

        /// PORTSC bits.
        pub mod portsc {
            pub const CCS: u64 = 1 << 0;
            pub const PED: u64 = 1 << 1;
            pub const PR: u64 = 1 << 4;
            pub const PP: u64 = 1 << 9;
            pub const CSC: u64 = 1 << 17;
            pub const PEC: u64 = 1 << 18;
            pub const PRC: u64 = 1 << 21;
        }
    }

    /// Constants for the runtime (interrupter) registers.
    pub mod runtime {
        /// Default interrupt moderation interval (in 250ns increments): 4000 = 1ms.
        pub const IMOD_DEFAULT: u64 = 4000;

        pub mod iman {
            pub const IP: u64 = 1 << 0;
            pub const IE: u64 = 1 << 1;
        }
    }

    /// Constants describing ring element layout and TRB type codes.
    pub mod rings {
        /// The size in bytes of a single TRB.
        pub const TRB_SIZE: usize = 16;

        /// Offsets within an Event Ring Segment Table Entry.
        pub mod event_ring {
            pub mod segments_table_entry_offsets {
                pub const BASE_ADDR: u64 = 0;
                pub const SIZE: u64 = 8;
            }
        }

        /// TRB type codes (xHCI 1.1 Table 6-91), shifted into the low 6 bits
        /// of the TRB Type field (control dword, bits 10-15).
        pub mod trb_types {
            pub const NORMAL: u8 = 1;
            pub const SETUP_STAGE: u8 = 2;
            pub const DATA_STAGE: u8 = 3;
            pub const STATUS_STAGE: u8 = 4;
            pub const ISOCH: u8 = 5;
            pub const LINK: u8 = 6;
            pub const EVENT_DATA: u8 = 7;
            pub const NO_OP: u8 = 8;
            pub const ENABLE_SLOT: u8 = 9;
            pub const DISABLE_SLOT: u8 = 10;
            pub const ADDRESS_DEVICE: u8 = 11;
            pub const CONFIGURE_ENDPOINT: u8 = 12;
            pub const EVALUATE_CONTEXT: u8 = 13;
            pub const RESET_ENDPOINT: u8 = 14;
            pub const STOP_ENDPOINT: u8 = 15;
            pub const SET_TR_DEQUEUE_POINTER: u8 = 16;
            pub const RESET_DEVICE: u8 = 17;
            pub const FORCE_HEADER: u8 = 22;
            pub const NO_OP_COMMAND: u8 = 23;
            pub const TRANSFER_EVENT: u8 = 32;
            pub const COMMAND_COMPLETION_EVENT: u8 = 33;
            pub const PORT_STATUS_CHANGE_EVENT: u8 = 34;
        }
    }

    /// Endpoint and device-slot related constants.
    pub mod device_slots {
        /// Endpoint Context state values (xHCI 1.1 Table 6-8).
        pub mod endpoint_state {
            pub const DISABLED: u8 = 0;
            pub const RUNNING: u8 = 1;
            pub const HALTED: u8 = 2;
            pub const STOPPED: u8 = 3;
            pub const ERROR: u8 = 4;
        }

        /// Slot Context state values (xHCI 1.1 Table 6-7).
        pub mod slot_state {
            pub const DISABLED_ENABLED: u8 = 0;
            pub const DEFAULT: u8 = 1;
            pub const ADDRESSED: u8 = 2;
            pub const CONFIGURED: u8 = 3;
        }

        /// Size, in bytes, of a single Slot/Endpoint Context entry.
        pub const CONTEXT_ENTRY_SIZE: u64 = 32;

        /// Size, in bytes, of the Input Control Context that prefixes an
        /// Input Device Context.
        pub const INPUT_CONTROL_CONTEXT_SIZE: u64 = 32;

        /// Number of Endpoint Context entries per device (EP0 + 15 pairs of
        /// IN/OUT endpoints, i.e. DCI 1..=31).
        pub const NUM_ENDPOINT_CONTEXTS: u64 = 31;
    }
}
