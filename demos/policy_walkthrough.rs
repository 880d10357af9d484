use std::sync::Arc;
use uvm_rs::api::{self, NUMA_NO_NODE};
use uvm_rs::tools::{EventListener, PerfEvent};
use uvm_rs::va::RangeTreeEntry;
use uvm_rs::{AccessType, Caller, Context, Gpu, Mm, ProcessorId, ProcessorUuid, UvmConfig, UvmResult};

// Prints every tools event as it is raised
struct PrintListener;

impl EventListener for PrintListener {
    fn on_event(&self, event: &PerfEvent) {
        println!("    event: {event:?}");
    }
}

fn main() -> UvmResult<()> {
    println!("--- UVM Policy Walkthrough ---");

    // 1. Driver context with two GPUs
    let ctx = Context::new(UvmConfig::from_env())?;
    let gpu_a = ProcessorUuid([0xa0; 16]);
    let gpu_b = ProcessorUuid([0xb0; 16]);
    ctx.add_gpu(Gpu::new(0, gpu_a))?;
    ctx.add_gpu(Gpu::new(1, gpu_b))?;

    // 2. A VA space for this process with both GPUs registered
    let caller = Caller::current(Some(Mm::for_current_process()));
    let va_space = ctx.create_va_space(&caller)?;
    va_space.events().register(Arc::new(PrintListener));
    api::register_gpu(&ctx, &va_space, &gpu_a)?;
    api::register_gpu(&ctx, &va_space, &gpu_b)?;

    // 3. One managed allocation of four pages
    let base = 0x7f00_0000_0000;
    let length = 0x4000;
    va_space.down_write().create_managed(base, length)?;
    println!("\nCreated managed range [0x{base:x}, 0x{:x})", base + length);

    println!("\n[CPU writes the first page]");
    api::service_fault(&ctx, &va_space, ProcessorId::CPU, base, AccessType::Write)?;

    println!("\n[GPU 0 accesses the second page remotely]");
    api::set_accessed_by(&ctx, &va_space, &caller, base + 0x1000, 0x1000, ProcessorId::gpu(0))?;
    api::service_fault(&ctx, &va_space, ProcessorId::CPU, base + 0x1000, AccessType::Write)?;

    println!("\n[Prefer GPU 1 for the last two pages]");
    api::set_preferred_location(
        &ctx,
        &va_space,
        &caller,
        base + 0x2000,
        0x2000,
        ProcessorId::gpu(1),
        NUMA_NO_NODE,
    )?;
    api::service_fault(&ctx, &va_space, ProcessorId::CPU, base + 0x3000, AccessType::Read)?;

    println!("\n[Read-duplicate the whole allocation]");
    api::set_accessed_by(&ctx, &va_space, &caller, base, length, ProcessorId::gpu(1))?;
    api::enable_read_duplication(&ctx, &va_space, &caller, base, length)?;

    println!("\n--- Ranges ---");
    for range in va_space.down_read().ranges().iter() {
        let policy = range.policy();
        println!(
            "  [0x{:x}, 0x{:x}] preferred={:?} accessed_by={:?} read_dup={:?}",
            range.start(),
            range.end(),
            policy.preferred_location,
            policy.accessed_by,
            policy.read_duplication
        );
    }

    // 4. Teardown
    ctx.destroy_va_space(va_space)?;
    println!("\nDone.");
    Ok(())
}
