use nv_rs::GpuConfig;
use nv_rs::thunk::DeviceContext;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Bring up the device from environment overrides
    let config = GpuConfig::from_env();
    println!("=== NVIDIA device {} ===", config.device_index);
    println!("  control: {}", config.paths.control.display());
    println!("  uvm:     {}", config.paths.uvm.display());
    println!("  gpu:     {}", config.paths.gpu.display());

    let ctx = DeviceContext::open(config)?;

    // 2. Identity and object hierarchy
    let h = ctx.handles();
    println!("\n[+] UUID: {}", ctx.gpu_uuid());
    println!("    root      {}", h.root);
    println!("    device    {}", h.device);
    println!("    subdevice {}", h.subdevice);
    println!("    usermode  {}", h.usermode);
    println!("    vaspace   {}", h.va_space);

    // 3. Control region
    let control = ctx.control_memory();
    println!(
        "\n[+] Control region: handle {} at 0x{:x} ({} KiB)",
        control.handle,
        control.gpu_va,
        control.size / 1024
    );

    // 4. SM issue rates
    let m = ctx.sm_issue_rate_modifiers()?;
    println!(
        "\n[+] Rate modifiers: imla0:{} fmla16:{} dp:{} fmla32:{} ffma:{} imla1:{} imla2:{} imla3:{} imla4:{}",
        m.imla0, m.fmla16, m.dp, m.fmla32, m.ffma, m.imla1, m.imla2, m.imla3, m.imla4
    );

    Ok(())
}
