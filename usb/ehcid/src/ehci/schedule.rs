use common::io::Io;
use common::{Dma, PhysMemory};
use log::{debug, error};

use super::phys32;
use super::qh::{QhEndpoint, QueueHead};
use super::qtd::{QtdStatus, LINK_TERMINATE};
use super::transfer::TransferPage;
use crate::driver_interface::EhciError;

/// Upper bound on queue heads visited while looking for a predecessor. Only one transient
/// queue head is ever linked next to the head, so a longer ring means corruption.
const MAX_RING_WALK: usize = 64;

/// The asynchronous schedule: a circular list of queue heads anchored at a permanent,
/// inactive head that carries the reclamation flag (EHCI 4.8).
pub struct AsyncList<'m> {
    mem: &'m dyn PhysMemory,
    head: Dma<'m, QueueHead>,
    head_phys: u32,
}

impl<'m> AsyncList<'m> {
    pub fn new(mem: &'m dyn PhysMemory) -> Result<Self, EhciError> {
        let mut head = unsafe { Dma::<QueueHead>::zeroed(mem)? };
        let head_phys = phys32(head.physical())?;

        head.update(|qh| {
            qh.set_link(head_phys);
            qh.configure(&QhEndpoint {
                address: 0,
                number: 0,
                max_packet: 64,
                reclamation_head: true,
                toggle_from_qtd: true,
            });
            qh.current.write(0);
            qh.overlay.next.write(LINK_TERMINATE);
            qh.overlay.alt_next.write(LINK_TERMINATE);
            qh.overlay.token.write(QtdStatus::HALTED.bits());
        });
        debug!("ehci: async schedule head at {:#x}", head_phys);

        Ok(Self {
            mem,
            head,
            head_phys,
        })
    }

    pub fn head_physical(&self) -> u32 {
        self.head_phys
    }

    /// Link the queue head of `page` right after the head.
    pub fn insert(&mut self, page: &mut Dma<'_, TransferPage>) -> Result<(), EhciError> {
        let qh_phys = phys32(page.physical())?;
        let next = self.head.observe(|head| head.horizontal.read());

        // The new entry must point into the ring before the ring points at it.
        page.update(|page| page.qh.horizontal.write(next));
        self.head.update(|head| head.set_link(qh_phys));
        Ok(())
    }

    /// Unlink the queue head of `page`, splicing its successor into its predecessor.
    pub fn remove(&mut self, page: &Dma<'_, TransferPage>) -> Result<(), EhciError> {
        let qh_phys = phys32(page.physical())?;
        let next = page.observe(|page| page.qh.horizontal.read());

        if self.head.observe(|head| head.link()) == qh_phys {
            self.head.update(|head| head.horizontal.write(next));
            return Ok(());
        }

        let mut current = self.head.observe(|head| head.link());
        for _ in 0..MAX_RING_WALK {
            if current == self.head_phys {
                break;
            }
            let qh = self.mem.phys_to_virt(current as usize) as *mut QueueHead;
            self.mem
                .invalidate_cache_range(qh as *const u8, std::mem::size_of::<QueueHead>());
            let qh = unsafe { &mut *qh };

            if qh.link() == qh_phys {
                qh.horizontal.write(next);
                self.mem
                    .flush_cache_range(qh as *const QueueHead as *const u8, std::mem::size_of::<QueueHead>());
                return Ok(());
            }
            current = qh.link();
        }

        error!("ehci: queue head {:#x} not found in the async schedule", qh_phys);
        Err(EhciError::NotLinked(qh_phys))
    }

    /// Physical addresses of the queue heads in ring order, starting at the head. `None` if the
    /// ring does not close on the head or some other queue head claims the reclamation flag.
    #[cfg(test)]
    pub(crate) fn walk(&self) -> Option<Vec<u32>> {
        if !self.head.observe(|head| head.is_reclamation_head()) {
            return None;
        }
        let mut ring = vec![self.head_phys];
        let mut current = self.head.observe(|head| head.link());
        while current != self.head_phys {
            if ring.len() > MAX_RING_WALK {
                return None;
            }
            let qh = unsafe { &*(self.mem.phys_to_virt(current as usize) as *const QueueHead) };
            if qh.is_reclamation_head() {
                return None;
            }
            ring.push(current);
            current = qh.link();
        }
        Some(ring)
    }
}
