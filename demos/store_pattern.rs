use nv_rs::GpuConfig;
use nv_rs::thunk::DeviceContext;
use nv_rs::thunk::queues::{ChannelBuilder, PollOptions, PushBuffer};
use tracing_subscriber::EnvFilter;

/// Stores the second constant-buffer argument (u32) to the address in the first (u64).
const STORE_KERNEL: [u64; 10] = [
    0x0000_5a00_ff05_7624, 0x000f_e200_078e_00ff, // IMAD.MOV.U32 R5, RZ, RZ, c[0x0][0x168]
    0x0000_5800_0002_7a02, 0x000f_e200_0000_0f00, // MOV R2, c[0x0][0x160]
    0x0000_5900_0003_7a02, 0x000f_ca00_0000_0f00, // MOV R3, c[0x0][0x164]
    0x0000_0005_0200_7986, 0x000f_e200_0c10_1904, // STG.E [R2.64], R5
    0x0000_0000_0000_794d, 0x000f_ea00_0380_0000, // EXIT
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Device and channel
    let config = GpuConfig::from_env();
    let options = PollOptions::from_config(&config);
    let mut ctx = DeviceContext::open(config)?;
    let mut channel = ChannelBuilder::new(&mut ctx).create()?;
    println!("[+] Channel ready, token 0x{:x}", channel.token());

    let layout = ctx.config().layout;
    let mut push = PushBuffer::new(&layout);
    let base = push.base();

    // 2. Kernel, arguments and launch
    let program: Vec<u8> = STORE_KERNEL.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut args = [0u8; 0x10];
    args[..8].copy_from_slice(&base.to_le_bytes());
    args[8..12].copy_from_slice(&0x1337u32.to_le_bytes());

    push.gpu_setup()?;
    push.memcpy(base + 4, &[0xaa, 0xbb, 0xcc, 0xdd])?;
    push.memcpy(base + 0x1000, &program)?;
    push.memcpy(base + 0x2160, &args)?;
    push.launch_compute(base + 0x4000, base + 0x1000, base + 0x2000, 0x160 + args.len() as u32)?;
    println!("[+] Push buffer: {} words", push.len());

    // 3. Submit and wait
    channel.submit(&ctx, &mut push)?;
    let status = channel.await_completion(&ctx, options)?;
    println!("[+] GP_GET {} after {:?}", status.value, status.elapsed);
    // GP_GET moves when the entry is fetched, not when the launch retires.
    std::thread::sleep(std::time::Duration::from_millis(10));

    // 4. Read back what the kernel stored
    let offset = (base - layout.control_base) as usize;
    let control = ctx.control_region();
    println!("    [0x{base:x}] = 0x{:08x}", control.read32(offset));
    println!("    [0x{:x}] = 0x{:08x}", base + 4, control.read32(offset + 4));

    Ok(())
}
