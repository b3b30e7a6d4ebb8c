//! # Device Slot Handling
//!
//! This module offers an abstraction for device slots, device contexts and
//! endpoint contexts.

use std::sync::Mutex;

use tracing::warn;

use crate::device::bus::BusDeviceRef;

use super::{
    constants::xhci::device_slots::{CONTEXT_ENTRY_SIZE, INPUT_CONTROL_CONTEXT_SIZE},
    realdevice::EndpointType,
    rings::TransferRing,
};

const NUM_ENDPOINT_CONTEXTS: usize =
    super::constants::xhci::device_slots::NUM_ENDPOINT_CONTEXTS as usize;

/// The shadow of a single Endpoint Context.
///
/// We only track the two fields the host controller itself is responsible
/// for advancing: the Transfer Ring Dequeue Pointer and the associated
/// Consumer Cycle State. Interior mutability is required because
/// [`TransferRing::next_transfer_trb`] only borrows its endpoint context
/// immutably while still needing to advance the dequeue pointer.
#[derive(Debug)]
pub struct EndpointContext {
    state: Mutex<(u64, bool)>,
}

impl EndpointContext {
    const fn new(dequeue_pointer: u64, cycle_state: bool) -> Self {
        Self {
            state: Mutex::new((dequeue_pointer, cycle_state)),
        }
    }

    /// Retrieve the current dequeue pointer and cycle state.
    pub fn get_dequeue_pointer_and_cycle_state(&self) -> (u64, bool) {
        *self.state.lock().unwrap()
    }

    /// Update the dequeue pointer and cycle state, e.g. after traversing a
    /// Link TRB.
    pub fn set_dequeue_pointer_and_cycle_state(&self, dequeue_pointer: u64, cycle_state: bool) {
        *self.state.lock().unwrap() = (dequeue_pointer, cycle_state);
    }
}

impl Clone for EndpointContext {
    fn clone(&self) -> Self {
        let (dequeue_pointer, cycle_state) = self.get_dequeue_pointer_and_cycle_state();
        Self::new(dequeue_pointer, cycle_state)
    }
}

/// The raw Endpoint Type field as stored in an Endpoint Context (xHCI 1.1 Table 6-9).
fn endpoint_type_from_raw(raw: u8) -> Option<EndpointType> {
    match raw {
        2 => Some(EndpointType::BulkOut),
        4 => Some(EndpointType::Control),
        6 => Some(EndpointType::BulkIn),
        7 => Some(EndpointType::InterruptIn),
        // Isoch and Interrupt-Out endpoints are not supported by the real-device
        // backend yet.
        _ => None,
    }
}

fn parse_endpoint_context(buffer: &[u8]) -> (Option<EndpointType>, u64, bool) {
    let ep_type_raw = (buffer[4] >> 3) & 0x7;
    let dequeue_pointer = u64::from_le_bytes(buffer[8..16].try_into().unwrap()) & !0xf;
    let dequeue_cycle_state = buffer[8] & 0x1 != 0;
    (
        endpoint_type_from_raw(ep_type_raw),
        dequeue_pointer,
        dequeue_cycle_state,
    )
}

/// Shadow state the host controller keeps per slot: the parsed root hub port
/// assignment and the transfer-ring state for every enabled endpoint.
///
/// This corresponds to the xHCI Device Context, except we never mirror it
/// back into guest memory: nothing in the emulated controller currently
/// reads the guest-visible Output Device Context, so we keep the
/// host-controller-owned fields purely as Rust state.
#[derive(Debug)]
pub struct DeviceContext {
    dma_bus: BusDeviceRef,
    endpoint_contexts: [Option<EndpointContext>; NUM_ENDPOINT_CONTEXTS],
    endpoint_states: [u8; NUM_ENDPOINT_CONTEXTS],
}

impl DeviceContext {
    fn new(dma_bus: BusDeviceRef) -> Self {
        Self {
            dma_bus,
            endpoint_contexts: [const { None }; NUM_ENDPOINT_CONTEXTS],
            endpoint_states: [0; NUM_ENDPOINT_CONTEXTS],
        }
    }

    fn read_endpoint_context(&self, input_context_pointer: u64, dci: u64) -> [u8; 32] {
        let offset =
            input_context_pointer + INPUT_CONTROL_CONTEXT_SIZE + dci * CONTEXT_ENTRY_SIZE;
        let mut buffer = [0; 32];
        self.dma_bus.read_bulk(offset, &mut buffer);
        buffer
    }

    /// Process an Address Device Command.
    ///
    /// Reads the Slot Context and the Control Endpoint (DCI 1) Context out of
    /// the guest-supplied Input Device Context and initializes the shadow
    /// state for the control endpoint.
    ///
    /// Returns the root hub port number the guest assigned to this slot.
    pub fn initialize(&mut self, input_context_pointer: u64) -> u8 {
        let mut slot_context = [0; 32];
        self.dma_bus.read_bulk(
            input_context_pointer + INPUT_CONTROL_CONTEXT_SIZE,
            &mut slot_context,
        );
        let root_hub_port_number = slot_context[6];

        let ep0_context = self.read_endpoint_context(input_context_pointer, 1);
        let (_, dequeue_pointer, cycle_state) = parse_endpoint_context(&ep0_context);
        self.endpoint_contexts[0] = Some(EndpointContext::new(dequeue_pointer, cycle_state));
        self.endpoint_states[0] = super::constants::xhci::device_slots::endpoint_state::RUNNING;

        root_hub_port_number
    }

    /// Process a Configure Endpoint Command.
    ///
    /// Reads the Input Control Context's Add Context flags and initializes
    /// shadow state for every newly added endpoint whose type we support.
    ///
    /// Returns the list of (endpoint id, endpoint type) pairs that were
    /// configured and must be enabled on the real device.
    pub fn configure_endpoints(&mut self, input_context_pointer: u64) -> Vec<(u8, EndpointType)> {
        let mut add_flags_bytes = [0; 4];
        self.dma_bus
            .read_bulk(input_context_pointer + 4, &mut add_flags_bytes);
        let add_flags = u32::from_le_bytes(add_flags_bytes);

        let mut enabled = Vec::new();
        for dci in 2..=31u64 {
            if add_flags & (1 << dci) == 0 {
                continue;
            }
            let ep_context = self.read_endpoint_context(input_context_pointer, dci);
            let (endpoint_type, dequeue_pointer, cycle_state) = parse_endpoint_context(&ep_context);
            let Some(endpoint_type) = endpoint_type else {
                warn!("ignoring endpoint at DCI {dci} with unsupported type");
                continue;
            };
            self.endpoint_contexts[(dci - 1) as usize] =
                Some(EndpointContext::new(dequeue_pointer, cycle_state));
            self.endpoint_states[(dci - 1) as usize] =
                super::constants::xhci::device_slots::endpoint_state::RUNNING;
            enabled.push((dci as u8, endpoint_type));
        }
        enabled
    }

    /// Build a [`TransferRing`] for the given endpoint ID (DCI).
    ///
    /// # Panics
    ///
    /// Panics if the endpoint has not been initialized via [`Self::initialize`]
    /// or [`Self::configure_endpoints`].
    pub fn get_transfer_ring(&self, endpoint_id: u64) -> TransferRing {
        let endpoint_context = self.endpoint_contexts[(endpoint_id - 1) as usize]
            .clone()
            .expect("endpoint context requested before being initialized");
        TransferRing::new(endpoint_context, self.dma_bus.clone())
    }

    /// Record the Endpoint Context state (e.g. after a Stop Endpoint Command).
    pub fn set_endpoint_state(&mut self, endpoint_id: u8, state: u8) {
        if let Some(slot) = self.endpoint_states.get_mut((endpoint_id - 1) as usize) {
            *slot = state;
        }
    }
}

/// Abstraction for Device Slots.
///
/// Each USB device needs a device slot ID to be addressable.
/// The slot ID is used in several places:
///
/// - index of the device context base address array (DCBAA), which points to
///   the associated device context.
/// - index of the doorbell register.
/// - referenced in event and command TRBs
///
/// The XHCI controller reports the maximum number of device slots in the
/// HCSPARAMS1 register. For device initialization, the driver requests a slot
/// ID using the Enable Slot Command. The `DeviceSlotManager` is responsible
/// of tracking which slot IDs are currently in use.
#[derive(Debug)]
pub struct DeviceSlotManager {
    /// Number of available slots.
    pub num_slots: u64,
    /// Slots that are currently in use.
    used_slots: Vec<u64>,
    /// Per-slot shadow device context, present once the slot is reserved.
    device_contexts: Vec<Option<DeviceContext>>,
    /// DMA address of the device context base address array.
    dcbaap: u64,
    /// Reference to the guest memory.
    dma_bus: BusDeviceRef,
}

impl DeviceSlotManager {
    /// Construct a new instance.
    ///
    /// There should only exist one `DeviceSlotManager` per `XhciController`.
    ///
    /// # Parameters
    ///
    /// - num_slots: number of available slots. Use the same value as the
    ///   controller reports in HCSPARAMS1.
    /// - dma_bus: a reference to the guest's memory.
    pub fn new(num_slots: u64, dma_bus: BusDeviceRef) -> Self {
        assert!(num_slots > 0);
        let mut device_contexts = Vec::with_capacity(num_slots as usize);
        device_contexts.resize_with(num_slots as usize, || None);
        Self {
            num_slots,
            used_slots: Vec::new(),
            device_contexts,
            dcbaap: 0,
            dma_bus,
        }
    }

    /// Set the address to the DCBAA.
    ///
    /// Call this function on writes to the DCBAAP MMIO register.
    pub const fn set_dcbaap(&mut self, dcbaap: u64) {
        self.dcbaap = dcbaap;
    }

    /// Read the address of the DCBAA.
    ///
    /// Call this function on reads of the DCBAAP MMIO register.
    pub const fn get_dcbaap(&self) -> u64 {
        self.dcbaap
    }

    /// Retrieve one of the available slot IDs.
    ///
    /// If a unused slot is available, this function returns the slot ID.
    /// Otherwise, it returns `Option::None`.
    ///
    /// This function has linear time complexity, which is reasonably fast for
    /// the use case of a handful of USB devices.
    pub fn reserve_slot(&mut self) -> Option<u64> {
        let available_slot_id =
            (1..=self.num_slots).find(|slot_id| !self.used_slots.contains(slot_id));

        if let Some(slot_id) = available_slot_id {
            self.used_slots.push(slot_id);
            self.device_contexts[(slot_id - 1) as usize] =
                Some(DeviceContext::new(self.dma_bus.clone()));
        }

        available_slot_id
    }

    /// Check whether a given slot ID is currently reserved.
    pub fn is_reserved(&self, slot_id: u64) -> bool {
        self.used_slots.contains(&slot_id)
    }

    /// Release a previously-reserved slot ID, dropping its device context.
    pub fn free_slot(&mut self, slot_id: u64) {
        self.used_slots.retain(|&id| id != slot_id);
        if let Some(slot) = self.device_contexts.get_mut((slot_id - 1) as usize) {
            *slot = None;
        }
    }

    /// Get the shadow device context for a reserved slot.
    pub fn get_device_context(&mut self, slot_id: u8) -> Option<&mut DeviceContext> {
        self.device_contexts
            .get_mut((slot_id as u64 - 1) as usize)
            .and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use crate::device::bus::BusDevice;

    use super::*;

    #[derive(Debug)]
    struct DummyMemory {}

    impl BusDevice for DummyMemory {
        fn size(&self) -> u64 {
            0
        }

        fn read(&self, _: crate::device::bus::Request) -> u64 {
            0
        }

        fn write(&self, _: crate::device::bus::Request, _: u64) {}
    }

    #[test]
    fn device_slot_reservation() {
        // we test with only one device slot, because that case is currently
        // what we run with
        let mut device_slot_manager = DeviceSlotManager::new(1, Arc::new(DummyMemory {}));

        // reserve the only slot
        assert_eq!(Some(1), device_slot_manager.reserve_slot());
        assert!(device_slot_manager.is_reserved(1));

        // reserving another slot should fail
        assert_eq!(None, device_slot_manager.reserve_slot());

        // freeing makes the slot available again
        device_slot_manager.free_slot(1);
        assert!(!device_slot_manager.is_reserved(1));
        assert_eq!(Some(1), device_slot_manager.reserve_slot());
    }

    #[test]
    fn dcbaap_roundtrip() {
        let mut device_slot_manager = DeviceSlotManager::new(1, Arc::new(DummyMemory {}));
        assert_eq!(0, device_slot_manager.get_dcbaap());
        device_slot_manager.set_dcbaap(0x1000);
        assert_eq!(0x1000, device_slot_manager.get_dcbaap());
    }
}
