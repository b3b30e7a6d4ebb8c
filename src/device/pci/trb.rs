//! Abstraction of the Transfer Request Block of a USB3 Host (XHCI) controller.
//!
//! The specification is available
//! [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).

use std::fmt;

use super::constants::xhci::rings::trb_types::*;

/// Raw, still-unparsed representation of a single 16-byte TRB.
pub type RawTrbBuffer = [u8; 16];

/// Returns a zero-initialized TRB buffer, suitable as a scratch area for DMA reads.
#[must_use]
pub const fn zeroed_trb_buffer() -> RawTrbBuffer {
    [0; 16]
}

const fn control_dword(buffer: &RawTrbBuffer) -> u32 {
    u32::from_le_bytes([buffer[12], buffer[13], buffer[14], buffer[15]])
}

const fn trb_type(buffer: &RawTrbBuffer) -> u8 {
    ((control_dword(buffer) >> 10) & 0x3f) as u8
}

const fn parameter(buffer: &RawTrbBuffer) -> u64 {
    u64::from_le_bytes([
        buffer[0], buffer[1], buffer[2], buffer[3], buffer[4], buffer[5], buffer[6], buffer[7],
    ])
}

const fn status_dword(buffer: &RawTrbBuffer) -> u32 {
    u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]])
}

/// Represents a TRB that the XHCI controller can place on the event ring.
#[derive(Debug)]
pub enum EventTrb {
    TransferEvent(TransferEventTrbData),
    CommandCompletionEvent(CommandCompletionEventTrbData),
    PortStatusChangeEvent(PortStatusChangeEventTrbData),
    //BandwidthRequestEvent,
    //DoorbellEvent,
    //HostControllerEvent,
    //DeviceNotificationEvent,
    //MfIndexWrapEvent,
}

impl EventTrb {
    /// Generates the byte representation of the TRB.
    ///
    /// The cycle bit's value does not depend on the TRB but on the ring that
    /// the TRB will be placed on.
    ///
    /// # Parameters
    ///
    /// - `cycle_bit`: value to set the cycle bit to. Has to match the ring
    ///   where the caller will write the TRB on.
    pub fn to_bytes(&self, cycle_bit: bool) -> [u8; 16] {
        // layout the event-type-specific data
        let mut trb_data = match self {
            EventTrb::TransferEvent(data) => data.to_bytes(),
            EventTrb::CommandCompletionEvent(data) => data.to_bytes(),
            EventTrb::PortStatusChangeEvent(data) => data.to_bytes(),
        };
        // set cycle bit
        trb_data[12] = (trb_data[12] & !0x1) | cycle_bit as u8;

        trb_data
    }
}

/// Stores the relevant data for a Transfer Event.
///
/// Do not use this struct directly, use `EventTrb::new_transfer_event_trb`
/// instead.
#[derive(Debug)]
pub struct TransferEventTrbData {
    trb_pointer: u64,
    residual_bytes: u32,
    completion_code: CompletionCode,
    event_data_flag: bool,
    endpoint_id: u8,
    slot_id: u8,
}

impl EventTrb {
    /// Create a new Transfer Event TRB.
    ///
    /// The XHCI spec describes this structure in Section 6.4.2.1.
    ///
    /// # Parameters
    ///
    /// - `trb_pointer`: address of the Transfer TRB that generated this
    ///   event (or, if `event_data_flag` is set, the Event Data field of an
    ///   Event Data TRB).
    /// - `residual_bytes`: number of bytes not transferred. This is a 24-bit
    ///   value, so the highest eight bit are ignored.
    /// - `completion_code`: encodes the completion status of the transfer.
    /// - `event_data_flag`: set if `trb_pointer` refers to an Event Data TRB
    ///   instead of the originating transfer TRB.
    /// - `endpoint_id`: the endpoint the transfer targeted.
    /// - `slot_id`: the device slot the transfer targeted.
    #[allow(clippy::too_many_arguments)]
    pub fn new_transfer_event_trb(
        trb_pointer: u64,
        residual_bytes: u32,
        completion_code: CompletionCode,
        event_data_flag: bool,
        endpoint_id: u8,
        slot_id: u8,
    ) -> EventTrb {
        EventTrb::TransferEvent(TransferEventTrbData {
            trb_pointer,
            residual_bytes,
            completion_code,
            event_data_flag,
            endpoint_id,
            slot_id,
        })
    }
}

impl TransferEventTrbData {
    fn to_bytes(&self) -> [u8; 16] {
        let mut trb = [0; 16];

        trb[0..8].copy_from_slice(&self.trb_pointer.to_le_bytes());
        trb[8..11].copy_from_slice(&self.residual_bytes.to_le_bytes()[0..3]);
        trb[11] = self.completion_code as u8;
        trb[12] = u8::from(self.event_data_flag) << 2;
        trb[13] = TRANSFER_EVENT << 2;
        trb[14] = self.endpoint_id & 0x1f;
        trb[15] = self.slot_id;

        trb
    }
}

/// Stores the relevant data for a Command Completion Event.
///
/// Do not use this struct directly, use EventTrb::new_command_completion_event_trb
/// instead.
#[derive(Debug)]
pub struct CommandCompletionEventTrbData {
    command_trb_pointer: u64,
    command_completion_parameter: u32,
    completion_code: CompletionCode,
    slot_id: u8,
}

impl EventTrb {
    /// Create a new Command Completion Event TRB.
    ///
    /// The XHCI spec describes this structure in Section 6.4.2.2.
    ///
    /// # Parameters
    ///
    /// - `command_trb_pointer`: 64-bit address of the Command TRB that
    ///   generated this event. The address has to be 16-byte-aligned, so the
    ///   lowest four bit have to be 0.
    /// - `command_completion_parameter`: Depends on the associated command.
    ///   This is a 24-bit value, so the highest eight bit are ignored.
    /// - `completion_code`: Encodes the completion status of the associated
    ///   command.
    /// - `slot_id`: The slot associated with command that generated this
    ///   event.
    #[allow(unused)]
    pub fn new_command_completion_event_trb(
        command_trb_pointer: u64,
        command_completion_parameter: u32,
        completion_code: CompletionCode,
        slot_id: u8,
    ) -> EventTrb {
        assert_eq!(
            0,
            command_trb_pointer & 0x0f,
            "command_trb_pointer has to be 16-byte-aligned."
        );
        assert_eq!(
            0,
            command_completion_parameter & 0xff000000,
            "command_completion_parameter has to be a 24-bit value."
        );
        EventTrb::CommandCompletionEvent(CommandCompletionEventTrbData {
            command_trb_pointer,
            command_completion_parameter,
            completion_code,
            slot_id,
        })
    }
}

impl CommandCompletionEventTrbData {
    fn to_bytes(&self) -> [u8; 16] {
        let mut trb = [0; 16];

        trb[0..8].copy_from_slice(&self.command_trb_pointer.to_le_bytes());
        trb[8..11].copy_from_slice(&self.command_completion_parameter.to_le_bytes()[0..3]);
        trb[11] = self.completion_code as u8;
        trb[13] = COMMAND_COMPLETION_EVENT << 2;
        trb[15] = self.slot_id;

        trb
    }
}

/// Stores the relevant data for a Port Status Change Event.
///
/// Do not use this struct directly, use EventTrb::new_port_status_change_event_trb
/// instead.
#[derive(Debug)]
pub struct PortStatusChangeEventTrbData {
    port_id: u8,
}

impl EventTrb {
    /// Create a new Port Status Change Event TRB.
    ///
    /// The XHCI spec describes this structure in Section 6.4.2.3.
    ///
    /// # Parameters
    ///
    /// - `port_id`: The number of the root hub port that generated this
    ///   event.
    pub fn new_port_status_change_event_trb(port_id: u8) -> EventTrb {
        EventTrb::PortStatusChangeEvent(PortStatusChangeEventTrbData { port_id })
    }
}

impl PortStatusChangeEventTrbData {
    fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];

        bytes[3] = self.port_id;
        bytes[11] = CompletionCode::Success as u8;
        bytes[13] = PORT_STATUS_CHANGE_EVENT << 2;

        bytes
    }
}

/// Encodes the completion code that some event TRBs contain.
#[allow(dead_code)]
#[derive(Debug, Copy, Clone)]
pub enum CompletionCode {
    Invalid = 0,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailableError,
    InvalidStreamTypeError,
    SlotNotEnabledError,
    EndpointNotEnabledError,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFullError,
    ParameterError,
    BandwidthOverrunError,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    StoppedShortedPacket,
    MaxExitLatencyTooLargeError,
    Reserved,
    IsochBufferOverrun,
    EventLostError,
    UndefinedError,
    InvalidStreamIdError,
    SecondaryBandwidthError,
    SplitTransactionError,
}

/// A parsed Link TRB, shared by Command Rings and Transfer Rings.
///
/// A Link TRB redirects ring traversal to another memory segment. We only
/// support rings made up of a single segment that links back to itself, so
/// the only field of interest besides the target pointer is the Toggle Cycle
/// bit, used when the single segment wraps around.
#[derive(Debug, Clone, Copy)]
pub struct LinkTrbData {
    /// Address of the next segment (16-byte aligned).
    pub ring_segment_pointer: u64,
    /// Whether the ring's producer cycle state has to be toggled when
    /// traversing this Link TRB.
    pub toggle_cycle: bool,
}

fn parse_link_trb_data(buffer: &RawTrbBuffer) -> LinkTrbData {
    LinkTrbData {
        ring_segment_pointer: parameter(buffer) & !0xf,
        toggle_cycle: control_dword(buffer) & 0x2 != 0,
    }
}

/// An error describing why a raw TRB could not be matched to any known
/// variant for the ring it was encountered on.
#[derive(Debug, Clone, Copy)]
pub struct UnrecognizedTrbError {
    trb_type: u8,
}

impl fmt::Display for UnrecognizedTrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized or unsupported TRB type {}", self.trb_type)
    }
}

impl std::error::Error for UnrecognizedTrbError {}

/// A parsed Command TRB together with the address it was read from.
///
/// The address is required to fill in the `command_trb_pointer` field of the
/// Command Completion Event generated in response to this command.
#[derive(Debug)]
pub struct CommandTrb {
    pub address: u64,
    pub variant: CommandTrbVariant,
}

/// The data carried by a Disable Slot Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct DisableSlotCommandTrbData {
    pub slot_id: u8,
}

/// The data carried by an Address Device Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct AddressDeviceCommandTrbData {
    pub slot_id: u8,
    pub input_context_pointer: u64,
    /// Block Set Address Request: if set, the device shall not be issued a
    /// SET_ADDRESS request, only its internal data structures are updated.
    pub block_set_address_request: bool,
}

/// The data carried by a Configure Endpoint Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct ConfigureEndpointCommandTrbData {
    pub slot_id: u8,
    pub input_context_pointer: u64,
    pub deconfigure: bool,
}

/// The data carried by an Evaluate Context Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct EvaluateContextCommandTrbData {
    pub slot_id: u8,
    pub input_context_pointer: u64,
}

/// The data carried by a Stop Endpoint Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct StopEndpointCommandTrbData {
    pub slot_id: u8,
    pub endpoint_id: u8,
    pub suspend: bool,
}

/// The data carried by a Set TR Dequeue Pointer Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct SetTrDequeuePointerCommandTrbData {
    pub slot_id: u8,
    pub endpoint_id: u8,
    pub new_dequeue_pointer: u64,
    pub dequeue_cycle_state: bool,
}

/// The data carried by a Reset Device Command TRB.
#[derive(Debug, Clone, Copy)]
pub struct ResetDeviceCommandTrbData {
    pub slot_id: u8,
}

/// The parsed variants of Command TRBs (xHCI 1.1 Section 6.4.3).
#[derive(Debug)]
pub enum CommandTrbVariant {
    EnableSlot,
    DisableSlot(DisableSlotCommandTrbData),
    AddressDevice(AddressDeviceCommandTrbData),
    ConfigureEndpoint(ConfigureEndpointCommandTrbData),
    EvaluateContext(EvaluateContextCommandTrbData),
    ResetEndpoint,
    StopEndpoint(StopEndpointCommandTrbData),
    SetTrDequeuePointer(SetTrDequeuePointerCommandTrbData),
    ResetDevice(ResetDeviceCommandTrbData),
    ForceHeader,
    NoOp,
    Link(LinkTrbData),
    Unrecognized(RawTrbBuffer, UnrecognizedTrbError),
}

impl CommandTrbVariant {
    /// Parse a raw TRB buffer read off the Command Ring.
    #[must_use]
    pub fn parse(buffer: RawTrbBuffer) -> Self {
        let control = control_dword(&buffer);
        let slot_id = (control >> 24) as u8;
        let endpoint_id = ((control >> 16) & 0x1f) as u8;

        match trb_type(&buffer) {
            ENABLE_SLOT => Self::EnableSlot,
            DISABLE_SLOT => Self::DisableSlot(DisableSlotCommandTrbData { slot_id }),
            ADDRESS_DEVICE => Self::AddressDevice(AddressDeviceCommandTrbData {
                slot_id,
                input_context_pointer: parameter(&buffer) & !0xf,
                block_set_address_request: control & 0x200 != 0,
            }),
            CONFIGURE_ENDPOINT => Self::ConfigureEndpoint(ConfigureEndpointCommandTrbData {
                slot_id,
                input_context_pointer: parameter(&buffer) & !0xf,
                deconfigure: control & 0x200 != 0,
            }),
            EVALUATE_CONTEXT => Self::EvaluateContext(EvaluateContextCommandTrbData {
                slot_id,
                input_context_pointer: parameter(&buffer) & !0xf,
            }),
            RESET_ENDPOINT => Self::ResetEndpoint,
            STOP_ENDPOINT => Self::StopEndpoint(StopEndpointCommandTrbData {
                slot_id,
                endpoint_id,
                suspend: control & 0x0080_0000 != 0,
            }),
            SET_TR_DEQUEUE_POINTER => {
                let param = parameter(&buffer);
                Self::SetTrDequeuePointer(SetTrDequeuePointerCommandTrbData {
                    slot_id,
                    endpoint_id,
                    new_dequeue_pointer: param & !0xf,
                    dequeue_cycle_state: param & 0x1 != 0,
                })
            }
            RESET_DEVICE => Self::ResetDevice(ResetDeviceCommandTrbData { slot_id }),
            FORCE_HEADER => Self::ForceHeader,
            NO_OP_COMMAND => Self::NoOp,
            LINK => Self::Link(parse_link_trb_data(&buffer)),
            other => Self::Unrecognized(buffer, UnrecognizedTrbError { trb_type: other }),
        }
    }
}

/// A parsed Transfer TRB together with the address it was read from.
#[derive(Debug)]
pub struct TransferTrb {
    pub address: u64,
    pub variant: TransferTrbVariant,
}

/// The data carried by a Setup Stage TRB.
#[derive(Debug, Clone, Copy)]
pub struct SetupStageTrbData {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// The data carried by a Data Stage TRB.
#[derive(Debug, Clone, Copy)]
pub struct DataStageTrbData {
    pub data_pointer: u64,
    pub transfer_length: u32,
    pub direction_in: bool,
    pub chain: bool,
}

/// The data carried by a Normal TRB.
#[derive(Debug, Clone, Copy)]
pub struct NormalTrbData {
    pub data_pointer: u64,
    pub transfer_length: u32,
    pub chain: bool,
    pub interrupt_on_completion: bool,
}

/// The parsed variants of Transfer TRBs (xHCI 1.1 Section 6.4.1).
#[derive(Debug)]
pub enum TransferTrbVariant {
    Normal(NormalTrbData),
    SetupStage(SetupStageTrbData),
    DataStage(DataStageTrbData),
    StatusStage,
    Link(LinkTrbData),
    Unrecognized(RawTrbBuffer, UnrecognizedTrbError),
}

impl TransferTrbVariant {
    /// Parse a raw TRB buffer read off a Transfer Ring.
    #[must_use]
    pub fn parse(buffer: RawTrbBuffer) -> Self {
        let control = control_dword(&buffer);
        let status = status_dword(&buffer);
        let chain = control & 0x10 != 0;
        let interrupt_on_completion = control & 0x20 != 0;

        match trb_type(&buffer) {
            NORMAL => Self::Normal(NormalTrbData {
                data_pointer: parameter(&buffer),
                transfer_length: status & 0x1_ffff,
                chain,
                interrupt_on_completion,
            }),
            SETUP_STAGE => Self::SetupStage(SetupStageTrbData {
                request_type: buffer[0],
                request: buffer[1],
                value: u16::from_le_bytes([buffer[2], buffer[3]]),
                index: u16::from_le_bytes([buffer[4], buffer[5]]),
                length: u16::from_le_bytes([buffer[6], buffer[7]]),
            }),
            DATA_STAGE => Self::DataStage(DataStageTrbData {
                data_pointer: parameter(&buffer),
                transfer_length: status & 0x1_ffff,
                direction_in: control & 0x1_0000 != 0,
                chain,
            }),
            STATUS_STAGE => Self::StatusStage,
            LINK => Self::Link(parse_link_trb_data(&buffer)),
            other => Self::Unrecognized(buffer, UnrecognizedTrbError { trb_type: other }),
        }
    }
}
