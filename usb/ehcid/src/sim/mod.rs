//! A software EHCI controller for tests.
//!
//! [SimHal] owns a small arena of "physical" pages. Page 0 holds the controller's register
//! block; the rest are handed out to the driver as DMA memory. Time only moves when the driver
//! waits, and every wait advances the controller by one step: command and status bits, root
//! port resets, and one pass over the asynchronous schedule against the devices attached to the
//! root ports.

use std::cell::{Cell, RefCell};
use std::ptr;

use common::{Clock, DmaError, PageFlags, PhysMemory, PAGE_SIZE};

use crate::pci::{PciConfig, PCI_BAR0, PCI_COMMAND};

mod controller;
mod device;
mod mass_storage;

pub use self::device::{Handshake, UsbFunction};
pub use self::mass_storage::{Fault, MassStorage};

use self::controller::Controller;

/// Physical address of the first page of the arena, the register block.
pub const SIM_MMIO_PHYS: usize = 0x1000_0000;
pub const SIM_PAGES: usize = 64;
/// Size reported for BAR0.
pub const SIM_BAR_SIZE: u32 = 0x400;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub ports: usize,
    /// HCCPARAMS.AC64
    pub ac64: bool,
    /// Clearing Run/Stop never halts the controller.
    pub ignore_stop: bool,
    /// HCRESET never completes.
    pub ignore_reset: bool,
    /// PR stays set once asserted.
    pub stuck_port_reset: bool,
    /// ASS stays set while the controller runs, whatever ASE says.
    pub stuck_async: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ports: 4,
            ac64: false,
            ignore_stop: false,
            ignore_reset: false,
            stuck_port_reset: false,
            stuck_async: false,
        }
    }
}

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

/// Byte access to the arena by physical address, as the controller sees it.
#[derive(Clone, Copy)]
pub(crate) struct SimMemory {
    base: *mut u8,
}

impl SimMemory {
    fn offset(phys: u32, len: usize) -> Option<usize> {
        let offset = (phys as usize).checked_sub(SIM_MMIO_PHYS)?;
        if offset + len <= SIM_PAGES * PAGE_SIZE {
            Some(offset)
        } else {
            None
        }
    }

    pub(crate) fn contains(&self, phys: u32, len: usize) -> bool {
        Self::offset(phys, len).is_some()
    }

    pub(crate) fn read_u32(&self, phys: u32) -> u32 {
        match Self::offset(phys, 4) {
            Some(offset) => unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) },
            None => 0,
        }
    }

    pub(crate) fn write_u32(&self, phys: u32, value: u32) {
        if let Some(offset) = Self::offset(phys, 4) {
            unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
        }
    }

    pub(crate) fn read_u8(&self, phys: u32) -> u8 {
        match Self::offset(phys, 1) {
            Some(offset) => unsafe { ptr::read_volatile(self.base.add(offset)) },
            None => 0,
        }
    }

    pub(crate) fn write_u8(&self, phys: u32, value: u8) {
        if let Some(offset) = Self::offset(phys, 1) {
            unsafe { ptr::write_volatile(self.base.add(offset), value) }
        }
    }
}

pub struct SimHal {
    memory: *mut [Page],
    free: RefCell<Vec<usize>>,
    page_limit: Cell<Option<usize>>,
    allocated: Cell<usize>,
    flushes: Cell<usize>,
    invalidates: Cell<usize>,
    mapped: RefCell<Vec<(usize, PageFlags)>>,
    time_us: Cell<u64>,
    ticks: Cell<u64>,
    controller: RefCell<Controller>,
}

impl SimHal {
    pub fn new(config: SimConfig) -> Self {
        let pages = (0..SIM_PAGES)
            .map(|_| Page([0; PAGE_SIZE]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let memory = Box::into_raw(pages);
        let hal = Self {
            memory,
            // Handed out from the low end first.
            free: RefCell::new((1..SIM_PAGES).rev().collect()),
            page_limit: Cell::new(None),
            allocated: Cell::new(0),
            flushes: Cell::new(0),
            invalidates: Cell::new(0),
            mapped: RefCell::new(Vec::new()),
            time_us: Cell::new(0),
            ticks: Cell::new(0),
            controller: RefCell::new(Controller::new(config)),
        };
        hal.controller.borrow_mut().power_up(hal.sim_memory());
        hal
    }

    fn sim_memory(&self) -> SimMemory {
        SimMemory {
            base: self.memory as *mut Page as *mut u8,
        }
    }

    /// Virtual address of the capability registers.
    pub fn mmio_base(&self) -> *mut u8 {
        self.phys_to_virt(SIM_MMIO_PHYS)
    }

    /// Plug `function` into root port `port`. It shows up once the port is powered.
    pub fn attach(&self, port: usize, function: impl UsbFunction + 'static) {
        self.controller.borrow_mut().attach(port, Box::new(function));
    }

    fn tick(&self) {
        self.ticks.set(self.ticks.get() + 1);
        self.controller.borrow_mut().tick(self.sim_memory());
    }

    pub fn time_us(&self) -> u64 {
        self.time_us.get()
    }
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub fn usb_cmd(&self) -> u32 {
        self.controller.borrow().usb_cmd(self.sim_memory())
    }
    pub fn usb_sts(&self) -> u32 {
        self.controller.borrow().usb_sts(self.sim_memory())
    }
    pub fn usb_intr(&self) -> u32 {
        self.controller.borrow().usb_intr(self.sim_memory())
    }
    pub fn async_list_addr(&self) -> u32 {
        self.controller.borrow().async_list_addr(self.sim_memory())
    }
    pub fn config_flag(&self) -> u32 {
        self.controller.borrow().config_flag(self.sim_memory())
    }
    pub fn portsc(&self, port: usize) -> u32 {
        self.controller.borrow().portsc(self.sim_memory(), port)
    }

    pub fn controller_resets(&self) -> usize {
        self.controller.borrow().resets()
    }
    pub fn doorbells(&self) -> usize {
        self.controller.borrow().doorbells()
    }
    /// How many times PORT_OWNER went from clear to set on `port`.
    pub fn handoffs(&self, port: usize) -> usize {
        self.controller.borrow().handoffs(port)
    }
    /// USB address of the device on `port`, if one is attached.
    pub fn device_address(&self, port: usize) -> Option<u8> {
        self.controller.borrow().device_address(port)
    }
    /// Bulk packets whose data toggle disagreed with the device's.
    pub fn toggle_mismatches(&self) -> usize {
        self.controller.borrow().toggle_mismatches()
    }

    /// Pages currently allocated to the driver.
    pub fn allocated_pages(&self) -> usize {
        self.allocated.get()
    }
    /// Refuse allocations once `limit` pages are out.
    pub fn set_page_limit(&self, limit: Option<usize>) {
        self.page_limit.set(limit);
    }
    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }
    pub fn invalidates(&self) -> usize {
        self.invalidates.get()
    }
    pub fn mapped_pages(&self) -> Vec<(usize, PageFlags)> {
        self.mapped.borrow().clone()
    }
}

impl Drop for SimHal {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.memory) });
    }
}

impl PhysMemory for SimHal {
    fn allocate_page(&self) -> Option<usize> {
        if let Some(limit) = self.page_limit.get() {
            if self.allocated.get() >= limit {
                return None;
            }
        }
        let index = self.free.borrow_mut().pop()?;
        self.allocated.set(self.allocated.get() + 1);
        Some(SIM_MMIO_PHYS + index * PAGE_SIZE)
    }

    unsafe fn free_page(&self, phys: usize) {
        let index = (phys - SIM_MMIO_PHYS) / PAGE_SIZE;
        assert!(index > 0 && index < SIM_PAGES, "freeing {:#x}", phys);
        self.free.borrow_mut().push(index);
        self.allocated.set(self.allocated.get() - 1);
    }

    fn phys_to_virt(&self, phys: usize) -> *mut u8 {
        let offset = phys
            .checked_sub(SIM_MMIO_PHYS)
            .filter(|offset| *offset < SIM_PAGES * PAGE_SIZE)
            .unwrap_or_else(|| panic!("{:#x} is outside the simulated memory", phys));
        unsafe { (self.memory as *mut Page as *mut u8).add(offset) }
    }

    fn virt_to_phys(&self, virt: *const u8) -> usize {
        let base = self.memory as *mut Page as usize;
        let offset = (virt as usize)
            .checked_sub(base)
            .filter(|offset| *offset < SIM_PAGES * PAGE_SIZE)
            .unwrap_or_else(|| panic!("{:p} is outside the simulated memory", virt));
        SIM_MMIO_PHYS + offset
    }

    fn flush_cache_range(&self, _virt: *const u8, _len: usize) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn invalidate_cache_range(&self, _virt: *const u8, _len: usize) {
        self.invalidates.set(self.invalidates.get() + 1);
    }

    fn map_page(&self, virt: *mut u8, phys: usize, flags: PageFlags) -> Result<(), DmaError> {
        if virt != self.phys_to_virt(phys) {
            return Err(DmaError::MapFailed(phys));
        }
        self.mapped.borrow_mut().push((phys, flags));
        Ok(())
    }
}

impl Clock for SimHal {
    fn now_ms(&self) -> u32 {
        (self.time_us.get() / 1000) as u32
    }

    fn delay_us(&self, us: u32) {
        self.time_us.set(self.time_us.get() + u64::from(us));
        self.tick();
    }
}

/// Configuration space of one function whose BAR0 reads as `bar0`.
pub struct SimPci {
    bar0: u32,
    command: Cell<u32>,
}

impl SimPci {
    pub fn new(bar0: u32) -> Self {
        Self {
            bar0,
            command: Cell::new(0),
        }
    }
}

impl PciConfig for SimPci {
    fn read_u32(&self, _bus: u8, _dev: u8, _func: u8, offset: u8) -> u32 {
        match offset {
            // Intel ICH EHCI
            0x00 => 0x293A_8086,
            PCI_COMMAND => self.command.get(),
            PCI_BAR0 => self.bar0,
            _ => 0,
        }
    }

    fn write_u32(&self, _bus: u8, _dev: u8, _func: u8, offset: u8, value: u32) {
        if offset == PCI_COMMAND {
            self.command.set(value);
        }
    }

    fn bar_size(&self, _bus: u8, _dev: u8, _func: u8, _offset: u8) -> u32 {
        SIM_BAR_SIZE
    }
}
