use kgsl_rs::hw::pm4::nop_packet;
use kgsl_rs::{
    CmdFlags, DeviceFlags, DeviceId, DriverContext, KgslConfig, KgslFile, MemFlags, Platform,
    PropertyType, TimestampType,
};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("              KGSL - Submit And Wait                        ");
    println!("============================================================");

    // 1. Bring up the platform and let the simulated 3D core run
    let config = KgslConfig::from_env();
    let platform = Platform::imx51(&config);
    let sim = platform
        .simulator(DeviceId::Yamato)
        .ok_or("platform has no 3D core")?;
    let _runner = sim.spawn(Duration::from_micros(100));
    let driver = Arc::new(DriverContext::new(config, platform)?);

    // 2. Open and start the device
    let mut file = KgslFile::open(driver.clone())?;
    println!("[+] Opened driver as pid {}", file.pid());
    file.device_start(DeviceId::Yamato, DeviceFlags::empty())?;
    println!("    {:?}", file.device_getproperty(DeviceId::Yamato, PropertyType::DeviceInfo)?);

    // 3. Build an indirect buffer of NOPs
    let ib = file.sharedmem_alloc(DeviceId::Yamato, MemFlags::empty(), 4096)?;
    let sizedwords = ib.size / 4;
    let mut words = vec![0u32; sizedwords as usize];
    words[0] = nop_packet(sizedwords - 1);
    file.sharedmem_write_words(&ib, 0, &words)?;
    println!("[+] IB at 0x{:08x}, {} dwords", ib.gpuaddr, sizedwords);

    // 4. Submit a few times and wait for the last one
    let mut last = 0;
    for _ in 0..4 {
        last = file.cmdstream_issueibcmds(DeviceId::Yamato, None, ib.gpuaddr, sizedwords, CmdFlags::empty())?;
        println!("    issued timestamp {last}");
    }
    file.cmdstream_waittimestamp(DeviceId::Yamato, last, Duration::from_secs(5))?;
    println!(
        "[+] Retired {}, consumed {}",
        file.cmdstream_readtimestamp(DeviceId::Yamato, TimestampType::Retired)?,
        file.cmdstream_readtimestamp(DeviceId::Yamato, TimestampType::Consumed)?
    );

    // 5. Hand the IB back on a timestamp and idle
    file.cmdstream_freememontimestamp(DeviceId::Yamato, ib, last)?;
    file.device_idle(DeviceId::Yamato, Duration::from_secs(1))?;

    let stats = sim.stats();
    println!(
        "[+] Simulator ran {} packets, {} indirect buffers",
        stats.packets, stats.indirect_buffers
    );

    drop(file);
    println!("[+] Closed; driver initialized: {}", driver.is_initialized());
    Ok(())
}
