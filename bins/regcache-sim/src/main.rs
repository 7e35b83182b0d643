mod config;
mod device;
mod registrar;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use sip_regcache::contact_hiding::{hide_contact, reveal_contact};
use sip_regcache::{
    spawn_gc, CacheMode, Clock, ContactValue, ForwardContact, RegisterCache, SystemClock,
    ThrottleDecision, TracingStorageHandler,
};
use smol_str::SmolStr;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::SimConfig;
use crate::device::Device;
use crate::registrar::MockRegistrar;

/// Drives a registration cache with simulated NATed devices and a mock
/// upstream registrar, then prints a JSON report.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON config file (see SimConfig)
    #[arg(long)]
    config: Option<PathBuf>,
    /// REGISTER processing path
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Number of simulated devices
    #[arg(long)]
    devices: Option<usize>,
    /// Number of distinct AORs
    #[arg(long)]
    aors: Option<usize>,
    /// Buckets per cache index
    #[arg(long)]
    bucket_count: Option<usize>,
    /// Seconds for the GC to visit every bucket
    #[arg(long)]
    gc_cycle_secs: Option<u64>,
    /// Lower bound for the expiry requested upstream
    #[arg(long)]
    min_reg_expires: Option<u32>,
    /// Upper bound for the expiry handed to devices
    #[arg(long)]
    max_ua_expires: Option<u32>,
    /// Simulated seconds to run
    #[arg(long, default_value_t = 600)]
    duration_secs: u64,
    /// Seed for the device behaviour
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    ContactHiding,
    RegisterCaching,
    Registrar,
}

fn map_mode(mode: ModeArg) -> CacheMode {
    match mode {
        ModeArg::ContactHiding => CacheMode::ContactHiding,
        ModeArg::RegisterCaching => CacheMode::RegisterCaching,
        ModeArg::Registrar => CacheMode::Registrar,
    }
}

/// Simulated time: one second per step, starting at the wall clock.
struct SimClock(AtomicI64);

impl SimClock {
    fn advance(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Clock for SimClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Serialize)]
struct Report {
    simulated_secs: i64,
    registers: u64,
    forwarded: u64,
    throttled: u64,
    rejected: u64,
    hidden_contacts: u64,
    aors: usize,
    bindings: usize,
    aliases: usize,
    contacts: usize,
    registrar_bindings: usize,
    evictions: u64,
    gc_sweeps: u64,
    alias_mismatches: u64,
}

#[tokio::main]
/// Entry point for the registration cache simulator.
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut sim = match &args.config {
        Some(path) => config::load(path)?,
        None => SimConfig::default(),
    };
    apply_overrides(&mut sim, &args);
    sim.validate()?;

    info!(
        mode = ?sim.cache.mode,
        devices = sim.devices,
        aors = sim.aors,
        duration = args.duration_secs,
        "starting registration cache simulation"
    );

    let cache = Arc::new(RegisterCache::with_storage_handler(
        sim.cache.clone(),
        Arc::new(TracingStorageHandler),
    ));
    let clock = Arc::new(SimClock(AtomicI64::new(SystemClock.now())));
    let gc = spawn_gc(cache.clone(), clock.clone());
    let registrar = MockRegistrar::new(sim.registrar_max_expires);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut devices: Vec<Device> = (0..sim.devices)
        .map(|i| Device::new(i, sim.aors, &mut rng))
        .collect();

    let mut report = Report::default();
    let start = clock.now();
    let mut ticker = time::interval(Duration::from_millis(sim.step_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
        }

        let now = clock.advance();
        if now - start > args.duration_secs as i64 {
            break;
        }

        for _ in 0..sim.registers_per_step {
            let device = &mut devices[rng.gen_range(0..sim.devices)];
            if rng.gen_bool(sim.rebind_probability) {
                device.rebind(&mut rng);
                debug!(device = %device.user, port = device.public_port, "NAT rebinding");
            }
            let expires = if rng.gen_bool(sim.unregister_probability) {
                0
            } else {
                sim.device_expires
            };

            report.registers += 1;
            if let Err(err) = process_register(&cache, &registrar, &sim, device, expires, now, &mut report) {
                warn!(device = %device.user, %err, "REGISTER rejected");
                report.rejected += 1;
            }
        }
    }

    gc.shutdown().await;
    cache.dump();

    let now = clock.now();
    let stats = cache.stats();
    let metrics = cache.metrics().snapshot();
    report.simulated_secs = now - start;
    report.aors = stats.aors;
    report.bindings = stats.bindings;
    report.aliases = stats.aliases;
    report.contacts = stats.contacts;
    report.registrar_bindings = registrar.binding_count(now);
    report.evictions = metrics.evictions;
    report.gc_sweeps = metrics.gc_sweeps;
    report.alias_mismatches = metrics.alias_mismatches;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn apply_overrides(sim: &mut SimConfig, args: &Args) {
    if let Some(mode) = args.mode {
        sim.cache.mode = map_mode(mode);
    }
    if let Some(devices) = args.devices {
        sim.devices = devices;
    }
    if let Some(aors) = args.aors {
        sim.aors = aors;
    }
    if let Some(count) = args.bucket_count {
        sim.cache.bucket_count = count;
    }
    if let Some(secs) = args.gc_cycle_secs {
        sim.cache.gc_cycle_secs = secs;
    }
    if let Some(secs) = args.min_reg_expires {
        sim.cache.min_reg_expires = secs;
    }
    if let Some(secs) = args.max_ua_expires {
        sim.cache.max_ua_expires = Some(secs);
    }
}

fn process_register(
    cache: &RegisterCache,
    registrar: &MockRegistrar,
    sim: &SimConfig,
    device: &Device,
    expires: u32,
    now: i64,
    report: &mut Report,
) -> Result<()> {
    let ctx = device.register(expires)?;

    match cache.config().mode {
        CacheMode::RegisterCaching => match cache.throttle_register(&ctx, now) {
            ThrottleDecision::Reply(contacts) => {
                report.throttled += 1;
                debug!(aor = %ctx.aor, contacts = contacts.len(), "answered from cache");
            }
            ThrottleDecision::Forward(reason) => {
                report.forwarded += 1;
                let forwarded = cache.prepare_forward(&ctx, &sim.contact_host);
                let reply = registrar.register(&ctx.aor, ctx.wildcard, &forwarded, now);
                let contacts = cache.apply_registrar_reply(&ctx, &forwarded, &reply, now);
                debug!(aor = %ctx.aor, %reason, contacts = contacts.len(), "forwarded to registrar");
            }
        },
        CacheMode::Registrar => {
            let contacts = cache.save_single_contact(&ctx, now)?;
            debug!(aor = %ctx.aor, contacts = contacts.len(), "answered as registrar");
        }
        CacheMode::ContactHiding => {
            let port = device.local_port.to_string();
            let vars = format!("si={};sp={}", device.public_ip, device.public_port);
            let hidden = hide_contact(&device.user, &device.local_ip, &port, &vars, &sim.hiding_prefix);

            let revealed = reveal_contact(&hidden, &sim.hiding_prefix)
                .ok_or_else(|| anyhow!("hidden contact does not decode: {}", hidden))?;
            if revealed.host != device.local_ip || revealed.user != device.user {
                return Err(anyhow!("hidden contact decoded to {:?}", revealed));
            }

            let contact = ForwardContact {
                original: ContactValue::new(device.contact(), Some(expires)),
                uri: SmolStr::new(format!("sip:{}@{}", hidden, sim.contact_host)),
                alias: SmolStr::new(hidden),
                requested: Some(expires),
                expires: Some(expires),
            };
            registrar.register(&ctx.aor, false, &[contact], now);
            report.hidden_contacts += 1;
            report.forwarded += 1;
        }
    }
    Ok(())
}
