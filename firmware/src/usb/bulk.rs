//! The vendor bulk interface carrying the command protocol and flux
//! streams: one OUT and one IN endpoint, high-speed, 512-byte packets.

use usb_device::class_prelude::*;
use usb_device::Result;

use crate::USB_HS_MPS;

pub struct VendorBulk<'a, B: UsbBus> {
    interface: InterfaceNumber,
    name: StringIndex,
    read_ep: EndpointOut<'a, B>,
    write_ep: EndpointIn<'a, B>,
    tx_busy: bool,
}

impl<B: UsbBus> VendorBulk<'_, B> {
    pub fn new(alloc: &UsbBusAllocator<B>) -> VendorBulk<B> {
        VendorBulk {
            interface: alloc.interface(),
            name: alloc.string(),
            read_ep: alloc
                .alloc(
                    Some(EndpointAddress::from(0x01)),
                    EndpointType::Bulk,
                    USB_HS_MPS,
                    0xff,
                )
                .expect("alloc_ep failed"),
            write_ep: alloc
                .alloc(
                    Some(EndpointAddress::from(0x81)),
                    EndpointType::Bulk,
                    USB_HS_MPS,
                    0xff,
                )
                .expect("alloc_ep failed"),
            tx_busy: false,
        }
    }

    /// Fetch a received packet, if one is waiting. Zero-length packets are
    /// delivered like any other.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> Option<usize> {
        self.read_ep.read(buf).ok()
    }

    /// True when the IN endpoint can accept another packet.
    pub fn tx_ready(&self) -> bool {
        !self.tx_busy
    }

    /// Queue a packet for transmission; an empty slice sends a ZLP.
    pub fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        self.write_ep.write(data)?;
        self.tx_busy = true;
        Ok(())
    }
}

impl<B: UsbBus> UsbClass<B> for VendorBulk<'_, B> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface_with_string(self.interface, 0xff, 0, 0, self.name)?;
        writer.endpoint(&self.read_ep)?;
        writer.endpoint(&self.write_ep)?;
        Ok(())
    }

    fn get_string(&self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        if index == self.name {
            Some("Flux Probe Bulk Interface")
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.tx_busy = false;
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.write_ep.address() {
            self.tx_busy = false;
        }
    }
}
