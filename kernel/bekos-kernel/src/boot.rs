//! High-half kernel bring-up.
//!
//! `kernel_main` is entered from the boot stub with the MMU on and the
//! image mapped high. Bring-up follows the dependency order: early
//! console and exception vectors, the kernel heap over its static initial
//! region, the device tree, the identity window over all of RAM, the
//! page allocator (with the kernel image, device tree, and
//! firmware-reserved ranges carved out), the memory manager, the device
//! registry and probe loop, the timing manager, and finally the process
//! manager adopting this thread as pid 0 before scheduling begins.

use core::fmt::Write;

use bekos_core::addr::{PAGE_SIZE, PhysAddr, PhysRegion, VirtAddr};
use bekos_mm::layout::{KERNEL_VBASE, SIZE_2M, VA_IDENT_OFFSET};
use bekos_mm::table::{MemAttrIndex, PageAttributes, TableManager};
use bekos_mm::{heap, ident, pmm};

use crate::arch::aarch64::{self, early};
use crate::devicetree::probe::{ProbeEntry, run_probes};
use crate::devicetree::{DeviceTree, resolve};

/// Initial heap region: carries every allocation until the page tier is
/// live, and the small-object tiers forever.
const INITIAL_HEAP_SIZE: usize = 1 << 20;

#[repr(C, align(128))]
struct InitialHeap([u8; INITIAL_HEAP_SIZE]);

static mut INITIAL_HEAP: InitialHeap = InitialHeap([0; INITIAL_HEAP_SIZE]);

// ---------------------------------------------------------------------------
// Early console
// ---------------------------------------------------------------------------

/// The debug UART's data register, at the fixed high-half mapping the
/// early boot installed. Everything beyond "bytes go here" belongs to the
/// real character driver.
struct EarlyUart;

impl Write for EarlyUart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            // SAFETY: The early table builder mapped this device page.
            unsafe {
                (early::EARLY_UART_VIRT as *mut u32).write_volatile(u32::from(byte));
            }
        }
        Ok(())
    }
}

fn early_print(args: core::fmt::Arguments<'_>) {
    let _ = EarlyUart.write_fmt(args);
}

unsafe extern "C" {
    static __kernel_end: u8;
    static __boot_stack_bottom: u8;
    static __boot_stack_top: u8;
}

/// The registered device-tree probe table. Drivers for the interrupt
/// controller, timer, and framebuffer are platform crates that appear
/// here when linked; the core always carries the PCIe host.
static PROBE_TABLE: [ProbeEntry; 1] = [ProbeEntry {
    name: "pcie-ecam",
    probe: crate::drivers::pcie::probe,
}];

/// High-half entry point; never returns.
///
/// # Panics
///
/// Panics (halting the boot) on any failure before the process manager
/// exists: these are all unrecoverable configuration errors.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    // SAFETY: Written once by the boot stub before jumping here.
    let handoff = unsafe { &*core::ptr::addr_of!(early::BOOT_HANDOFF) };

    aarch64::register_portable_hooks();
    aarch64::exceptions::install_vector_table();
    bekos_core::log::set_print_fn(early_print);
    bekos_core::kinfo!("boot", "bekos starting, load base {:#x}", handoff.load_base);

    // Heap before anything that allocates.
    let heap_base = VirtAddr::new(core::ptr::addr_of!(INITIAL_HEAP) as u64);
    heap::init(heap_base, INITIAL_HEAP_SIZE);

    // Parse the device tree from its boot mapping.
    // SAFETY: The early boot mapped [devtree_virt, +devtree_size) RO.
    let dtb_bytes = unsafe {
        core::slice::from_raw_parts(
            handoff.devtree_virt as *const u8,
            handoff.devtree_size as usize,
        )
    };
    let dtb = bekos_fdt::Dtb::parse(dtb_bytes).expect("invalid device tree");
    let mut tree = DeviceTree::from_dtb(&dtb);

    // Adopt the boot tables and map every RAM window into the identity
    // region, in 2 MiB blocks. Until that window exists, the only view of
    // the scratch table pages is the kernel image's high mapping (linked
    // at KERNEL_VBASE + physical), so the phys→virt translation
    // temporarily routes through it.
    ident::init(KERNEL_VBASE);
    // SAFETY: The handoff names the live root and the unused scratch.
    let mut tables = unsafe {
        TableManager::global(
            PhysAddr::new(handoff.root_table),
            PhysAddr::new(handoff.scratch_next),
            PhysAddr::new(handoff.scratch_end),
        )
    };
    let memory = resolve::get_memory_regions(&tree);
    assert!(!memory.is_empty(), "device tree names no memory");
    for window in &memory {
        let start = window.start.align_down(SIZE_2M);
        let size = (window.end().align_up(SIZE_2M)) - start;
        tables
            .map_region(
                VirtAddr::new_truncate(VA_IDENT_OFFSET + start.as_u64()),
                start,
                size,
                PageAttributes::KERNEL_DATA,
                MemAttrIndex::Normal,
            )
            .expect("identity window mapping failed");
    }
    // All of RAM is visible now; switch to the real window.
    ident::init(VA_IDENT_OFFSET);

    // Page allocator over the RAM windows, minus everything already in
    // use: the kernel image (with its boot scratch), the device tree,
    // and the firmware-reserved ranges.
    pmm::init();
    pmm::with(|pa| {
        for window in &memory {
            pa.register_new_region(*window);
        }
        // The high half is linked at KERNEL_VBASE + physical, so the
        // image's physical end is its link end minus the offset. Reserve
        // from address zero to cover firmware pages below the load base.
        let kernel_phys_end = core::ptr::addr_of!(__kernel_end) as u64 - KERNEL_VBASE;
        pa.mark_as_reserved(PhysRegion::new(
            PhysAddr::new(0),
            kernel_phys_end.div_ceil(PAGE_SIZE) * PAGE_SIZE,
        ));
        pa.mark_as_reserved(PhysRegion::new(
            PhysAddr::new(handoff.dtb_phys).align_down(PAGE_SIZE),
            handoff.devtree_size,
        ));
        for reserved in resolve::get_reserved_regions(&tree) {
            pa.mark_as_reserved(reserved);
        }
    });
    bekos_core::kinfo!(
        "boot",
        "{} RAM window(s), {} pages free",
        memory.len(),
        pmm::with(|pa| pa.free_pages())
    );

    // The memory manager owns the kernel tables from here on.
    crate::mm::init(tables);

    // Device discovery.
    crate::drivers::registry::init();
    let summary = run_probes(&mut tree, &PROBE_TABLE);
    bekos_core::kinfo!(
        "boot",
        "probe: {} bound, {} failed, {} waiting",
        summary.succeeded,
        summary.failed,
        summary.still_waiting
    );

    // Timing wants a timer device from the registry; without one the
    // scheduler tick (and Sleep) stay dark.
    let have_timer = crate::drivers::timer::initialise().is_ok();
    if !have_timer {
        bekos_core::kwarn!("boot", "no timer device; running untick'd");
    }

    aarch64::enable_interrupts();

    // Become pid 0 and start scheduling.
    let stack_bottom = core::ptr::addr_of!(__boot_stack_bottom) as u64 - KERNEL_VBASE;
    let stack_top = core::ptr::addr_of!(__boot_stack_top) as u64 - KERNEL_VBASE;
    crate::proc::initialise_and_adopt(
        "boot",
        PhysRegion::new(PhysAddr::new(stack_bottom), stack_top - stack_bottom),
    );
    if have_timer {
        crate::proc::start_scheduler_tick();
    }

    bekos_core::kinfo!("boot", "entering idle");
    loop {
        aarch64::wait_for_interrupt();
    }
}
