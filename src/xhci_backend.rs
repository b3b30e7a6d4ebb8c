use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use nusb::MaybeFuture;
use tracing::{debug, info, trace, warn};
use usbvfiod::hotplug_protocol::device_paths::resolve_path;

use vfio_bindings::bindings::vfio::{
    vfio_region_info, VFIO_PCI_BAR0_REGION_INDEX, VFIO_PCI_BAR1_REGION_INDEX,
    VFIO_PCI_BAR2_REGION_INDEX, VFIO_PCI_BAR3_REGION_INDEX, VFIO_PCI_BAR4_REGION_INDEX,
    VFIO_PCI_BAR5_REGION_INDEX, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_MSIX_IRQ_INDEX,
    VFIO_PCI_NUM_IRQS, VFIO_PCI_NUM_REGIONS, VFIO_REGION_INFO_FLAG_READ,
    VFIO_REGION_INFO_FLAG_WRITE,
};
use vfio_user::{IrqInfo, ServerBackend};

use crate::device::{
    bus::{Request, RequestSize},
    interrupt_line::{DummyInterruptLine, InterruptLine},
    pci::{
        nusb::NusbDeviceWrapper, realdevice::IdentifiableRealDevice, traits::PciDevice,
        xhci::XhciController,
    },
};

use crate::{dynamic_bus::DynamicBus, memory_segment::MemorySegment};

#[derive(Debug)]
pub struct XhciBackend {
    dma_bus: Arc<DynamicBus>,
    controller: Arc<Mutex<XhciController>>,
}

#[derive(Debug)]
struct InterruptEventFd {
    /// TODO: Get rid of the Mutex. Writes to the EventFd are safe.
    ///  This just satisfies the Send + Sync requirements and provides
    ///  interior mutability for the [`InterruptLine`] trait.
    fd: Mutex<File>,
}

impl InterruptLine for InterruptEventFd {
    fn interrupt(&self) {
        // Write any 8 byte value to the EventFd.
        // TODO: we just expect this to always work currently.
        let _amount = self
            .fd
            .lock()
            .unwrap()
            .write(&1u64.to_le_bytes())
            .expect("should always be able to write event fd");
    }
}

impl XhciBackend {
    /// Create a new virtual XHCI controller with the given USB
    /// devices attached at creation time.
    pub fn new<I>(devices: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let dma_bus = Arc::new(DynamicBus::new());

        let backend = Self {
            controller: Arc::new(Mutex::new(XhciController::new(dma_bus.clone()))),
            dma_bus,
        };

        for device in devices {
            backend.add_device_from_path(device)?;
        }

        Ok(backend)
    }

    /// Return a handle to the shared controller state, for the hot-attach
    /// server to attach and detach devices at runtime.
    pub fn controller(&self) -> Arc<Mutex<XhciController>> {
        self.controller.clone()
    }

    /// Add a USB device to the virtual XHCI controller.
    fn add_device(&self, bus: u8, device_number: u8, device: nusb::Device) -> Result<()> {
        // The configuration is not super interesting, but as long as
        // we don't do anything else here this serves as a way to see
        // whether the file is actually a USB device.
        let active_configuration = device
            .active_configuration()
            .context("Failed to query active configuration")?;

        debug!("Device configuration: {active_configuration:?}");

        let wrapped_device = Box::new(NusbDeviceWrapper::new(device));
        self.controller
            .lock()
            .unwrap()
            .attach_device(IdentifiableRealDevice {
                bus_number: bus,
                device_number,
                real_device: wrapped_device,
            })
            .map_err(|response| anyhow::anyhow!("Failed to attach USB device: {response:?}"))?;

        Ok(())
    }

    /// Add a USB device via its path in `/dev/bus/usb`.
    pub fn add_device_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path: &Path = path.as_ref();
        let (bus, device_number, canonical_path) = resolve_path(path)
            .with_context(|| format!("Failed to resolve device path {}", path.display()))?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&canonical_path)
            .with_context(|| format!("Failed to open USB device file: {}", path.display()))?;

        let device = nusb::Device::from_fd(file.into())
            .wait()
            .context("Failed to open nusb device")?;

        self.add_device(bus, device_number, device)
    }
}

impl XhciBackend {
    /// Return a list of regions for [`vfio_user::Server::new`].
    pub fn regions(&self) -> Vec<vfio_region_info> {
        (0..VFIO_PCI_NUM_REGIONS)
            .map(|i| {
                let empty_region = vfio_region_info {
                    argsz: size_of::<vfio_region_info>() as u32,
                    index: i,
                    ..Default::default()
                };

                match i {
                    VFIO_PCI_CONFIG_REGION_INDEX => {
                        debug!("Client queried config space region");

                        vfio_region_info {
                            argsz: size_of::<vfio_region_info>() as u32,
                            index: i,
                            size: 256,
                            flags: VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
                            ..Default::default()
                        }
                    }

                    VFIO_PCI_BAR0_REGION_INDEX
                    | VFIO_PCI_BAR1_REGION_INDEX
                    | VFIO_PCI_BAR2_REGION_INDEX
                    | VFIO_PCI_BAR3_REGION_INDEX
                    | VFIO_PCI_BAR4_REGION_INDEX
                    | VFIO_PCI_BAR5_REGION_INDEX => {
                        let bar_no = i - VFIO_PCI_BAR0_REGION_INDEX;

                        if let Some(bar_info) = u8::try_from(bar_no)
                            .ok()
                            .and_then(|bar_no| self.controller.bar(bar_no))
                        {
                            debug!("Client queried BAR{bar_no} region: {:?}", bar_info);
                            vfio_region_info {
                                argsz: size_of::<vfio_region_info>() as u32,
                                index: i,
                                size: bar_info.size.into(),
                                flags: VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
                                ..Default::default()
                            }
                        } else {
                            debug!("Client queried BAR{bar_no} region: (empty)");
                            empty_region
                        }
                    }

                    unknown => {
                        debug!("Client queried unknown VFIO region: {unknown}");
                        empty_region
                    }
                }
            })
            .collect()
    }

    /// Return a list of IRQs for [`vfio_user::Server::new`].
    pub fn irqs(&self) -> Vec<IrqInfo> {
        (0..VFIO_PCI_NUM_IRQS)
            .map(|index| IrqInfo {
                index,
                count: match index {
                    VFIO_PCI_MSIX_IRQ_INDEX => 1,
                    _ => 0,
                },
                flags: 0,
            })
            .collect()
    }
}

impl ServerBackend for XhciBackend {
    fn region_read(
        &mut self,
        region: u32,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), std::io::Error> {
        trace!("read  region {region} offset {offset:#x}+{}", data.len());

        let value: u64 = match region {
            VFIO_PCI_CONFIG_REGION_INDEX => self.controller.read_cfg(Request::new(
                offset,
                RequestSize::try_from(data.len() as u64).expect("should use valid request size"),
            )),

            0 => self.controller.read_io(
                0,
                Request::new(
                    offset,
                    RequestSize::try_from(data.len() as u64)
                        .expect("should use valid request size"),
                ),
            ),

            _ => !0u64,
        };

        data.copy_from_slice(&value.to_le_bytes()[0..data.len()]);

        Ok(())
    }

    fn region_write(
        &mut self,
        region: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<(), std::io::Error> {
        trace!(
            "write region {region} offset {offset:#x}+{} val {:?}",
            data.len(),
            data
        );

        let value = match data.len() {
            1 => data[0].into(),
            2 => {
                let val: [u8; 2] = data.try_into().unwrap();
                u16::from_le_bytes(val).into()
            }
            4 => {
                let val: [u8; 4] = data.try_into().unwrap();
                u32::from_le_bytes(val).into()
            }
            len => {
                warn!("dropping region write with unsupported length {len}");
                return Ok(());
            }
        };

        match region {
            VFIO_PCI_CONFIG_REGION_INDEX => self.controller.write_cfg(
                Request::new(
                    offset,
                    RequestSize::try_from(data.len() as u64)
                        .expect("should use valid request size"),
                ),
                value,
            ),

            0 => self.controller.write_io(
                0,
                Request::new(
                    offset,
                    RequestSize::try_from(data.len() as u64)
                        .expect("should use valid request size"),
                ),
                value,
            ),
            region => {
                warn!("dropping write to unknown VFIO region {region}");
            }
        }

        Ok(())
    }

    fn dma_map(
        &mut self,
        flags: vfio_user::DmaMapFlags,
        offset: u64,
        address: u64,
        size: u64,
        fd: Option<File>,
    ) -> Result<(), std::io::Error> {
        info!("dma_map flags = {flags:?} offset = {offset} address = {address} size = {size} fd = {fd:?}");

        if let Some(fd) = fd {
            let mseg = MemorySegment::new_from_fd(
                &fd,
                offset,
                size,
                // We want to know when this happens, so bail out eagerly here.
                flags.try_into().expect("Failed to convert flags"),
            )?;

            self.dma_bus.add(address, Arc::new(mseg)).unwrap();
        } else {
            warn!("dropping dma_map request without a file descriptor");
        }

        Ok(())
    }

    fn dma_unmap(
        &mut self,
        _flags: vfio_user::DmaUnmapFlags,
        address: u64,
        _size: u64,
    ) -> Result<(), std::io::Error> {
        info!("dma_unmap address = {address}");
        self.dma_bus.remove(address);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), std::io::Error> {
        info!("resetting xHCI controller on VMM request");
        self.controller.lock().unwrap().reset();
        Ok(())
    }

    fn set_irqs(
        &mut self,
        index: u32,
        flags: u32,
        start: u32,
        count: u32,
        fds: Vec<File>,
    ) -> Result<(), std::io::Error> {
        debug!(
            "set IRQs: {index} flags: {flags:#x} start: {start:#x} count: {count:#x} #fds: {}",
            fds.len()
        );
        assert_eq!(
            index, VFIO_PCI_MSIX_IRQ_INDEX,
            "Only MSI-X interrupts are supported"
        );
        assert!(count <= 1, "Only a single interrupt is supported");

        let irqs: Vec<Arc<InterruptEventFd>> = fds
            .into_iter()
            .map(|file| {
                Arc::new(InterruptEventFd {
                    fd: Mutex::new(file),
                })
            })
            .collect();

        let irq: Arc<dyn InterruptLine> = match irqs.first() {
            Some(eventfd) => eventfd.clone(),
            _ => Arc::new(DummyInterruptLine::default()),
        };

        self.controller.lock().unwrap().connect_irq(irq);

        Ok(())
    }
}
