pub mod heap;
pub mod layout;
pub mod paging;
pub mod physical;

use bootloader_api::info::MemoryRegions;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{Mapper, Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Bump allocator over the MMIO window; device drivers never unmap, so a
/// bump pointer is sufficient.
static MMIO_NEXT_ADDR: Mutex<u64> = Mutex::new(layout::MMIO_BASE);

/// Bring up physical allocation, paging and the kernel heap, in that
/// order: paging's `init` needs a usable mapper before heap pages can be
/// mapped, and `physical::alloc` needs the bitmap built first.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    log::info!("initializing memory management");
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);

    physical::init(memory_regions);

    let mapper = unsafe { paging::init(physical_memory_offset) };
    unsafe {
        paging::enable_global_pages();
    }

    heap::init(&mapper).expect("heap initialization failed");

    log::info!("memory management initialized");
}

pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("physical memory offset not initialized")
}

pub fn phys_to_virt(phys: PhysAddr, offset: VirtAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + offset.as_u64())
}

/// Map a physical MMIO region into kernel virtual address space and
/// return the virtual address it landed at. Mappings are uncacheable
/// and write-through, never unmapped.
pub fn map_mmio(phys_addr: u64, size: usize) -> Result<usize, &'static str> {
    let phys_offset = physical_memory_offset();
    let size_aligned = (size + 0xFFF) & !0xFFF;
    let num_pages = size_aligned / 4096;

    let virt_addr = {
        let mut next = MMIO_NEXT_ADDR.lock();
        let addr = *next;
        *next += size_aligned as u64;
        addr
    };

    log::info!(
        "mmio: mapping {:#x} -> {:#x} ({} pages)",
        phys_addr,
        virt_addr,
        num_pages
    );

    let mut mapper = unsafe { paging::get_mapper_with_offset(phys_offset) };

    for i in 0..num_pages {
        let page_phys = phys_addr + (i * 4096) as u64;
        let page_virt = virt_addr + (i * 4096) as u64;

        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(page_virt));
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(page_phys));

        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH;

        unsafe {
            mapper
                .map_to(page, frame, flags, &mut physical::GlobalFrameAllocator)
                .map_err(|_| "failed to map MMIO page")?
                .flush();
        }
    }

    Ok(virt_addr as usize)
}
