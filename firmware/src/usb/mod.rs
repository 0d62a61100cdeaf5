//! USB device composition: the vendor bulk interface plus Microsoft OS
//! descriptors for driverless WinUSB binding.

use flux_probe_bsp::otg_hs::{UsbBus, UsbBusType};
use flux_probe_bsp::rcc::Clocks;
use stm32ral::{otg_hs_device, otg_hs_global, otg_hs_pwrclk, read_reg, usbphyc};
use usb_device::bus::UsbBusAllocator;
use usb_device::prelude::*;

mod bulk;
mod winusb;

use bulk::VendorBulk;
use winusb::MicrosoftDescriptors;

/// Connection events surfaced to the floppy state machine.
#[derive(Copy, Clone, PartialEq)]
pub enum Event {
    /// Host configured the device: enter command processing.
    Configured,
    /// Bus reset or suspend: quiesce everything.
    Deconfigured,
}

struct UninitializedUSB {
    phy: usbphyc::Instance,
    global: otg_hs_global::Instance,
    device: otg_hs_device::Instance,
    pwrclk: otg_hs_pwrclk::Instance,
}

struct InitializedUSB {
    device: UsbDevice<'static, UsbBusType>,
    winusb: MicrosoftDescriptors,
    bulk: VendorBulk<'static, UsbBusType>,
}

enum State {
    Uninitialized(UninitializedUSB),
    Initialized(InitializedUSB),
    Initializing,
}

impl State {
    pub fn as_initialized(&self) -> &InitializedUSB {
        if let State::Initialized(initialized) = self {
            initialized
        } else {
            panic!("USB is not initialized yet");
        }
    }

    pub fn as_initialized_mut(&mut self) -> &mut InitializedUSB {
        if let State::Initialized(initialized) = self {
            initialized
        } else {
            panic!("USB is not initialized yet");
        }
    }
}

static mut EP_MEMORY: [u32; 1024] = [0; 1024];
static mut USB_BUS: Option<UsbBusAllocator<UsbBusType>> = None;

/// USB stack interface
pub struct USB {
    state: State,
    was_configured: bool,
}

impl USB {
    /// Create a new USB object from the peripheral instances
    pub fn new(
        phy: usbphyc::Instance,
        global: otg_hs_global::Instance,
        device: otg_hs_device::Instance,
        pwrclk: otg_hs_pwrclk::Instance,
    ) -> Self {
        let usb = UninitializedUSB {
            phy,
            global,
            device,
            pwrclk,
        };
        USB {
            state: State::Uninitialized(usb),
            was_configured: false,
        }
    }

    /// Initialise the USB peripheral ready to start processing packets
    pub fn setup(&mut self, clocks: &Clocks, serial: &'static str) {
        let state = core::mem::replace(&mut self.state, State::Initializing);
        if let State::Uninitialized(usb) = state {
            cortex_m::interrupt::free(|_| unsafe {
                let usb = flux_probe_bsp::otg_hs::USB {
                    usb_phy: usb.phy,
                    usb_global: usb.global,
                    usb_device: usb.device,
                    usb_pwrclk: usb.pwrclk,
                    hclk: clocks.hclk(),
                };

                let usb_bus = UsbBus::new(usb, &mut EP_MEMORY);
                USB_BUS = Some(usb_bus);
                let usb_bus = USB_BUS.as_ref().unwrap();

                let winusb = MicrosoftDescriptors;
                let bulk = VendorBulk::new(usb_bus);

                let device = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x1209, 0x4d69))
                    .manufacturer("Keir Fraser")
                    .product("Flux Probe")
                    .serial_number(serial)
                    .device_class(0)
                    .build();

                let usb = InitializedUSB {
                    device,
                    winusb,
                    bulk,
                };
                self.state = State::Initialized(usb)
            });
        } else {
            panic!("Invalid state");
        }
    }

    /// Service the bus. Returns a configuration-edge event when the host
    /// configures or deconfigures the device.
    pub fn poll(&mut self) -> Option<Event> {
        let usb = self.state.as_initialized_mut();
        usb.device.poll(&mut [&mut usb.winusb, &mut usb.bulk]);

        let configured = usb.device.state() == UsbDeviceState::Configured;
        if configured != self.was_configured {
            self.was_configured = configured;
            if configured {
                return Some(Event::Configured);
            } else {
                return Some(Event::Deconfigured);
            }
        }
        None
    }

    /// Fetch a received bulk packet, if one is waiting.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> Option<usize> {
        let usb = self.state.as_initialized_mut();
        usb.bulk.read_packet(buf)
    }

    /// True when the bulk IN endpoint can accept another packet.
    pub fn tx_ready(&self) -> bool {
        let usb = self.state.as_initialized();
        usb.bulk.tx_ready()
    }

    /// Queue a bulk IN packet; an empty slice sends a ZLP.
    pub fn write_packet(&mut self, data: &[u8]) {
        let usb = self.state.as_initialized_mut();
        // The state machine only writes when tx_ready() says so.
        usb.bulk.write_packet(data).ok();
    }

    /// Negotiated speed, straight from the device status register.
    pub fn is_highspeed(&self) -> bool {
        let dev = unsafe { &*otg_hs_device::OTG_HS_DEVICE };
        read_reg!(otg_hs_device, dev, OTG_HS_DSTS, ENUMSPD) == 0
    }
}
