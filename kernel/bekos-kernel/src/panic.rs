//! Kernel panic handling: report and halt.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    bekos_core::kprintln!("\n*** kernel panic: {} ***", info);
    loop {
        crate::arch::wait_for_interrupt();
    }
}
