use deltaprof::{
    current_labels, with_labels, Config, Count, CpuCollector, LabelSet, Session, UploadJob,
    Upstream,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ROUNDS: u64 = 3;

const ENDPOINTS: [&str; 2] = ["/checkout", "/search"];

/// Synthetic call stacks standing in for decoded runtime records.
const STACKS: [&[u64]; 3] = [
    &[0x401000, 0x401a20, 0x402f10],
    &[0x401000, 0x401a20, 0x403330],
    &[0x401000, 0x404100],
];

#[derive(Debug, Default)]
struct LogUpstream {}

impl Upstream for LogUpstream {
    fn upload(&self, job: UploadJob) -> anyhow::Result<()> {
        log::info!(
            "Upload {} {} [{} .. {}] {} bytes",
            job.id,
            job.name,
            job.start.format("%H:%M:%S%.3f"),
            job.end.format("%H:%M:%S%.3f"),
            job.payload.len()
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    colog::init();

    log::info!("Starting deltaprof");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "deltaprof.toml".to_string());
    let mut config = Config::load_optional(Path::new(&path));
    if config.application_name.is_empty() {
        config.application_name = "deltaprof.demo".into();
    }
    config.manual_flush = true;

    let kinds: Vec<_> = config
        .profile_types
        .iter()
        .filter_map(|t| t.delta_kind())
        .collect();

    let collector = Arc::new(CpuCollector::new());
    let session = Arc::new(Session::new(
        config,
        Arc::clone(&collector),
        Arc::new(LogUpstream::default()),
    )?);
    session.start()?;

    let sampler = {
        let collector = Arc::clone(&collector);
        thread::spawn(move || {
            let mut delivered = 0;
            for tick in 0u64..300 {
                if collector.deliver(&tick.to_le_bytes()) {
                    delivered += 1;
                }
                thread::sleep(Duration::from_millis(1));
            }
            delivered
        })
    };

    for round in 1..=ROUNDS {
        for kind in kinds.iter() {
            for (i, stack) in STACKS.iter().enumerate() {
                let endpoint: LabelSet = [("endpoint", ENDPOINTS[i % ENDPOINTS.len()])]
                    .into_iter()
                    .collect();
                let i = i as i64 + 1;
                let n = round as i64;
                with_labels(&endpoint, || {
                    session.record_labeled(
                        *kind,
                        stack,
                        &current_labels(),
                        Count::new(n * i, n * i * 1024),
                    )
                })?;
            }
        }
        session.flush()?;
        thread::sleep(Duration::from_millis(100));
    }

    match sampler.join() {
        Ok(delivered) => log::info!("Sampler delivered {} records", delivered),
        Err(_) => log::warn!("Sampler thread panicked"),
    }
    session.stop()?;

    Ok(())
}
