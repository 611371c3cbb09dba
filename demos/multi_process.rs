use kgsl_rs::hw::pm4::nop_packet;
use kgsl_rs::{
    CmdFlags, ContextType, DeviceFlags, DeviceId, DrawCtxtFlags, DriverContext, KgslConfig,
    KgslFile, MemFlags, Pid, Platform,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIENTS: Pid = 4;
const SUBMITS: usize = 16;

fn client(driver: Arc<DriverContext>, pid: Pid) -> Result<u32, kgsl_rs::KgslError> {
    let mut file = KgslFile::open_as(driver, pid)?;
    file.device_start(DeviceId::Yamato, DeviceFlags::empty())?;
    let ctx = file.context_create(DeviceId::Yamato, ContextType::OpenGl, DrawCtxtFlags::NO_GMEM_ALLOC)?;

    let ib = file.sharedmem_alloc(DeviceId::Yamato, MemFlags::empty(), 1024)?;
    let sizedwords = ib.size / 4;
    let mut words = vec![0u32; sizedwords as usize];
    words[0] = nop_packet(sizedwords - 1);
    file.sharedmem_write_words(&ib, 0, &words)?;

    let mut last = 0;
    for _ in 0..SUBMITS {
        let ts = file.cmdstream_issueibcmds(DeviceId::Yamato, Some(ctx), ib.gpuaddr, sizedwords, CmdFlags::empty())?;
        assert!(last == 0 || kgsl_rs::utils::timestamp_cmp(ts, last).is_gt());
        last = ts;
    }
    file.cmdstream_waittimestamp(DeviceId::Yamato, last, Duration::from_secs(10))?;
    // Contexts, blocks and the start reference go with the handle.
    Ok(last)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("              KGSL - Concurrent Clients                     ");
    println!("============================================================");

    let config = KgslConfig::from_env().with_per_process_pagetable(true);
    let platform = Platform::imx51(&config);
    let sim = platform
        .simulator(DeviceId::Yamato)
        .ok_or("platform has no 3D core")?;
    let _runner = sim.spawn(Duration::from_micros(50));
    let driver = Arc::new(DriverContext::new(config, platform)?);

    let handles: Vec<_> = (1..=CLIENTS)
        .map(|pid| {
            let driver = driver.clone();
            thread::spawn(move || (pid, client(driver, pid)))
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok((pid, Ok(ts))) => println!("[+] pid {pid}: last timestamp {ts}"),
            Ok((pid, Err(e))) => println!("[-] pid {pid}: {e}"),
            Err(_) => println!("[-] client thread panicked"),
        }
    }

    println!(
        "[+] Processes left: {}, driver initialized: {}",
        driver.process_count(),
        driver.is_initialized()
    );
    Ok(())
}
