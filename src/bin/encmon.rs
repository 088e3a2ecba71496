//! encmon CLI — measure images, run a simulated monitor, inspect and verify reports
//!
//! Commands:
//!   encmon measure          — digest of a loader/runtime/application triple
//!   encmon platform-digest  — digest of a monitor image
//!   encmon demo             — two enclaves, a connection, a mailbox transfer and a verified report
//!   encmon inspect          — decode a report
//!   encmon verify           — verify a report against artifacts and a nonce

use clap::{Parser, Subcommand};
use enclave_monitor::attest::{DeviceKey, FsArtifacts, MemoryArtifacts, MonitorIdentity, Report, Verifier};
use enclave_monitor::measure::{measure_platform, Digest, ImageBundle};
use enclave_monitor::monitor::{EnclaveId, Monitor, MonitorConfig, SimulatedPlatform};
use ed25519_dalek::VerifyingKey;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;

type CliResult = Result<(), Box<dyn Error>>;

const DEMO_MONITOR_IMAGE: &[u8] = b"encmon simulated security monitor v1";

#[derive(Parser, Debug)]
#[command(name = "encmon", version, about = "Enclave monitor toolkit")]
struct Cli {
    /// Monitor configuration (JSON); defaults apply when omitted
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the measurement of an image triple
    Measure {
        #[arg(long, value_name = "FILE")]
        loader: PathBuf,
        #[arg(long, value_name = "FILE")]
        runtime: PathBuf,
        #[arg(long, value_name = "FILE")]
        app: PathBuf,
    },
    /// Print the digest of a monitor image padded to the platform region
    PlatformDigest {
        #[arg(long, value_name = "FILE")]
        image: PathBuf,
    },
    /// Run two enclaves end to end on the simulated platform
    Demo {
        /// Write artifacts, report and public key here for `encmon verify`
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Decode a binary report and print it as JSON
    Inspect { report: PathBuf },
    /// Verify a binary report
    Verify {
        report: PathBuf,
        /// Device public key (hex)
        #[arg(long)]
        public_key: String,
        /// Challenge nonce the report must echo (hex)
        #[arg(long)]
        nonce: String,
        #[arg(long, value_name = "FILE")]
        loader: PathBuf,
        #[arg(long, value_name = "FILE")]
        runtime: PathBuf,
        /// Image reference of the attested enclave, as logged by its peers
        #[arg(long)]
        subject: String,
        /// Directory that image references are resolved against
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
        /// Expected platform digest (hex)
        #[arg(long)]
        platform: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Measure {
            loader,
            runtime,
            app,
        } => cmd_measure(&loader, &runtime, &app),
        Command::PlatformDigest { image } => cmd_platform_digest(&config, &image),
        Command::Demo { out } => cmd_demo(config, out.as_deref()),
        Command::Inspect { report } => cmd_inspect(&report),
        Command::Verify {
            report,
            public_key,
            nonce,
            loader,
            runtime,
            subject,
            root,
            platform,
        } => cmd_verify(
            &report,
            &public_key,
            &nonce,
            &loader,
            &runtime,
            &subject,
            root,
            platform.as_deref(),
        ),
    });

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<MonitorConfig, Box<dyn Error>> {
    match path {
        Some(p) => Ok(MonitorConfig::load(p)?),
        None => Ok(MonitorConfig::default()),
    }
}

fn parse_public_key(s: &str) -> Result<VerifyingKey, Box<dyn Error>> {
    let bytes = hex::decode(s.trim())?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("public key must be 32 bytes, got {}", b.len()))?;
    Ok(VerifyingKey::from_bytes(&arr)?)
}

fn cmd_measure(loader: &Path, runtime: &Path, app: &Path) -> CliResult {
    let bundle = ImageBundle::from_files(loader, runtime, app)?;
    println!("  Image pages: {}", bundle.image_pages());
    println!("  Digest: {}", bundle.measure());
    Ok(())
}

fn cmd_platform_digest(config: &MonitorConfig, image: &Path) -> CliResult {
    let bytes = std::fs::read(image)?;
    if bytes.len() > config.platform_region_size {
        return Err(format!(
            "image is {} bytes, platform region is {}",
            bytes.len(),
            config.platform_region_size
        )
        .into());
    }
    println!("  Platform digest: {}", measure_platform(&bytes, config.platform_region_size));
    Ok(())
}

fn cmd_inspect(path: &Path) -> CliResult {
    let report = Report::from_bytes(&std::fs::read(path)?)?;
    println!("{}", report.to_json()?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_verify(
    path: &Path,
    public_key: &str,
    nonce: &str,
    loader: &Path,
    runtime: &Path,
    subject: &str,
    root: Option<PathBuf>,
    platform: Option<&str>,
) -> CliResult {
    let report = Report::from_bytes(&std::fs::read(path)?)?;
    let artifacts = match root {
        Some(dir) => FsArtifacts::with_root(dir),
        None => FsArtifacts::new(),
    };
    let mut verifier = Verifier::new(
        parse_public_key(public_key)?,
        std::fs::read(loader)?,
        std::fs::read(runtime)?,
        artifacts,
    );
    if let Some(expected) = platform {
        verifier = verifier.with_platform(Digest::from_hex(expected)?);
    }

    let v = verifier.verify(&report, subject, &hex::decode(nonce.trim())?);
    println!("\n  Verification of {}:", path.display());
    println!("  {}", "-".repeat(60));
    println!("  signature: {}", v.signature_valid);
    println!("  digest:    {}", v.digest_matches);
    println!("  history:   {}", v.history_matches);
    match v.platform_matches {
        Some(ok) => println!("  platform:  {}", ok),
        None => println!("  platform:  (not checked)"),
    }
    println!("  nonce:     {}", v.nonce_matches);
    for d in &v.diagnostics {
        println!("    - {}", d);
    }

    if v.is_trusted() {
        println!("\n  TRUSTED");
        Ok(())
    } else {
        Err("report did not verify".into())
    }
}

fn demo_artifacts() -> (Vec<u8>, Vec<u8>, Vec<(&'static str, Vec<u8>)>) {
    let loader = b"loader:".iter().copied().cycle().take(6000).collect();
    let runtime = b"runtime:".iter().copied().cycle().take(9000).collect();
    let apps = vec![
        ("sensor", b"sensor-app ".repeat(300)),
        ("actuator", b"actuator-app ".repeat(200)),
    ];
    (loader, runtime, apps)
}

fn launch(
    monitor: &mut Monitor<SimulatedPlatform>,
    bundle: &ImageBundle,
) -> Result<EnclaveId, Box<dyn Error>> {
    let id = monitor.allocate(bundle.image_pages() + 4)?;
    let layout = monitor.load_image(id, bundle)?;
    monitor.finalize(id, layout)?;
    monitor.run(id)?;
    println!(
        "  {} {} digest={}",
        id,
        bundle.reference,
        monitor.measurement(id)?.short()
    );
    Ok(id)
}

fn cmd_demo(config: MonitorConfig, out: Option<&Path>) -> CliResult {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║              encmon — Simulated Monitor Demo                 ║
║       Measure + Connect + Mailbox + Attest + Verify          ║
╚══════════════════════════════════════════════════════════════╝
"#
    );

    // Step 1: Monitor
    println!("Step 1: Starting monitor...");
    println!("{}", "-".repeat(60));
    let key = DeviceKey::generate();
    let public_key = key.verifying_key();
    let identity = MonitorIdentity::from_image(key, DEMO_MONITOR_IMAGE, config.platform_region_size);
    let platform_digest = *identity.platform_digest();
    let mut monitor = Monitor::new(config, SimulatedPlatform::new(), identity)?;
    println!("  Device key: {}", hex::encode(public_key.as_bytes()));
    println!("  Platform:   {}", platform_digest.short());

    // Step 2: Enclaves
    println!("\nStep 2: Launching enclaves...");
    println!("{}", "-".repeat(60));
    let (loader, runtime, apps) = demo_artifacts();
    let bundles: Vec<ImageBundle> = apps
        .iter()
        .map(|(name, app)| {
            ImageBundle::new(format!("/apps/{}.eapp", name), loader.clone(), runtime.clone(), app.clone())
        })
        .collect();
    let sensor = launch(&mut monitor, &bundles[0])?;
    let actuator = launch(&mut monitor, &bundles[1])?;

    // Step 3: Connection
    println!("\nStep 3: Connecting {} -> {}...", sensor, actuator);
    println!("{}", "-".repeat(60));
    monitor.connect(sensor, actuator)?;
    println!("  {} history={}", sensor, monitor.hash_history(sensor)?.short());
    println!("  {} history={}", actuator, monitor.hash_history(actuator)?.short());

    // Step 4: Mailbox transfer across threads
    println!("\nStep 4: Mailbox transfer...");
    println!("{}", "-".repeat(60));
    let outbox = monitor.outbox(sensor, actuator)?;
    let inbox = monitor.inbox(actuator)?;
    let readings = ["temp=21.5", "temp=21.7", "temp=22.0"];
    let producer = thread::spawn(move || {
        for r in readings {
            outbox.send(r.as_bytes());
        }
    });
    for _ in readings {
        let msg = inbox.recv_vec();
        let text = String::from_utf8_lossy(&msg);
        println!("  {} received: {}", actuator, text.trim_end_matches('\0'));
    }
    producer.join().map_err(|_| "mailbox producer panicked")?;

    // Step 5: Attestation
    println!("\nStep 5: Attesting {}...", sensor);
    println!("{}", "-".repeat(60));
    let nonce: [u8; 16] = rand::random();
    let report = monitor.attest(sensor, &nonce)?;
    println!("  Nonce:  {}", hex::encode(nonce));
    println!("  Report: {} bytes, {} log entries", report.to_bytes().len(), report.connection_log().len());

    let mut artifacts = MemoryArtifacts::new();
    for bundle in &bundles {
        artifacts.insert(bundle.reference.clone(), bundle.app.clone());
    }
    let verifier = Verifier::new(public_key, loader.clone(), runtime.clone(), artifacts)
        .with_platform(platform_digest);
    let v = verifier.verify(&report, &bundles[0].reference, &nonce);
    println!("  Verified: {}", if v.is_trusted() { "TRUSTED" } else { "REJECTED" });

    let wrong: [u8; 16] = rand::random();
    let stale = verifier.verify(&report, &bundles[0].reference, &wrong);
    println!("  Wrong nonce: {}", if stale.is_trusted() { "TRUSTED" } else { "REJECTED" });

    if let Some(dir) = out {
        std::fs::create_dir_all(dir.join("apps"))?;
        std::fs::write(dir.join("loader.bin"), &loader)?;
        std::fs::write(dir.join("runtime.bin"), &runtime)?;
        for bundle in &bundles {
            std::fs::write(dir.join(bundle.reference.trim_start_matches('/')), &bundle.app)?;
        }
        std::fs::write(dir.join("report.bin"), report.to_bytes())?;
        std::fs::write(dir.join("device.pub"), hex::encode(public_key.as_bytes()))?;
        std::fs::write(dir.join("nonce.hex"), hex::encode(nonce))?;
        println!("\n  Wrote artifacts and report to {}", dir.display());
        println!(
            "  Check with: encmon verify {}/report.bin --public-key $(cat {}/device.pub) --nonce $(cat {}/nonce.hex) \\",
            dir.display(),
            dir.display(),
            dir.display()
        );
        println!(
            "    --loader {0}/loader.bin --runtime {0}/runtime.bin --root {0} --subject {1} --platform {2}",
            dir.display(),
            bundles[0].reference,
            platform_digest
        );
    }

    // Step 6: Teardown
    println!("\nStep 6: Teardown...");
    println!("{}", "-".repeat(60));
    monitor.disconnect(sensor, actuator)?;
    for id in [sensor, actuator] {
        println!("  {} {:?}", id, monitor.destroy(id));
    }
    Ok(())
}
