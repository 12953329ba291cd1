//! Capabilities command

use haiku_compute::GpuContext;
use haiku_compute::kernels::KERNELS;

pub fn run() {
    println!("Haiku Compute Capabilities");
    println!("==========================\n");

    let adapters = GpuContext::enumerate_adapters();
    if adapters.is_empty() {
        println!("GPU: not available");
    } else {
        println!("GPU adapters:");
        for adapter in &adapters {
            println!("  - {}", adapter.name);
            println!("    Backend:  {:?}", adapter.backend);
            println!("    Type:     {:?}", adapter.device_type);
            if !adapter.driver.is_empty() {
                println!("    Driver:   {} {}", adapter.driver, adapter.driver_info);
            }
        }
    }

    println!();
    println!("Kernels:");
    for kernel in KERNELS {
        let writes = kernel
            .bindings
            .iter()
            .filter(|access| access.is_writable())
            .count();
        println!(
            "  {:<18} {} buffers ({} written), {} parameter bytes",
            kernel.name,
            kernel.bindings.len(),
            writes,
            kernel.params_size
        );
    }
}
