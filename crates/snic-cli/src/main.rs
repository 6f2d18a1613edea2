//! snicd: the software simple-NIC device backend.
//!
//! Bootstraps against the host (device id, BAR4 base, MSI-X table), binds
//! the 16 TLP tag channels, bridges the emulated NIC to a local tap, and
//! then sits in the MWr callback loop until SIGINT.

mod signal;

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use snic_device::{run_tap_reader, SnicConfig, SnicDevice};
use snic_msg::{MsgClient, SelectorScheme, MSG_PORT};
use snic_tap::Tap;
use snic_tlp::{NetTlp, NetTlpConfig};

/// Software emulation of a simple PCIe NIC, bridged to a local tap.
#[derive(Parser, Debug)]
#[command(name = "snicd", version)]
struct Args {
    /// Adapter-side address of the TLP link
    #[arg(short = 'r', long)]
    remote: Ipv4Addr,

    /// Device-side address of the TLP link
    #[arg(short = 'l', long)]
    local: Ipv4Addr,

    /// Address of the host's out-of-band message responder
    #[arg(short = 'R', long)]
    host: Ipv4Addr,

    /// Tap interface to bridge the NIC to
    #[arg(short = 'i', long = "tap", default_value = "tap0")]
    tap: String,

    /// Speak the legacy OOB selector numbering (no device-id query; the
    /// id comes from --bdf)
    #[arg(long, requires = "bdf")]
    legacy_oob: bool,

    /// PCI id as hex <bus>:<devfn>, only meaningful with --legacy-oob
    #[arg(short = 'b', long, value_parser = parse_bdf)]
    bdf: Option<u16>,

    /// BAR4 base as hex, overriding the OOB query
    #[arg(short = 'a', long, value_parser = parse_hex_u64)]
    bar4: Option<u64>,
}

fn parse_bdf(s: &str) -> Result<u16, String> {
    let (bus, devfn) = s
        .split_once(':')
        .ok_or_else(|| String::from("expected <bus>:<devfn>"))?;
    let bus = u8::from_str_radix(bus, 16).map_err(|e| format!("bus: {e}"))?;
    let devfn = u8::from_str_radix(devfn, 16).map_err(|e| format!("devfn: {e}"))?;
    Ok(u16::from(bus) << 8 | u16::from(devfn))
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let tap = Tap::open(&args.tap).with_context(|| format!("tap {:?}", args.tap))?;
    info!(name = tap.name(), "tap ready");

    let scheme = if args.legacy_oob {
        SelectorScheme::Legacy
    } else {
        SelectorScheme::Current
    };
    let msg = MsgClient::connect(SocketAddr::from((args.host, MSG_PORT)), scheme)
        .context("reach the OOB message responder")?;

    let requester = match (args.legacy_oob, args.bdf) {
        (true, Some(bdf)) => bdf,
        (true, None) => bail!("--legacy-oob requires --bdf"),
        (false, _) => msg.device_id().context("query device id")?,
    };

    let tlp = Arc::new(
        NetTlp::new(&NetTlpConfig::new(args.local, args.remote, requester))
            .context("bind TLP tag channels")?,
    );

    let bar4_base = match args.bar4 {
        Some(base) => base,
        None => msg.bar4_base().context("query BAR4 base")?,
    };
    if bar4_base == 0 {
        bail!("host reports BAR4 base 0; the driver has not bound the device");
    }
    let msix = msg.msix_table().context("query MSI-X table")?;
    let cfg = SnicConfig {
        bar4_base,
        tx_irq: msix[0],
        rx_irq: msix[1],
    };
    info!(
        device = format_args!("{requester:04x}"),
        bar4 = format_args!("{bar4_base:#x}"),
        tx_irq = format_args!("{:#x}:{:#010x}", cfg.tx_irq.addr, cfg.tx_irq.data),
        rx_irq = format_args!("{:#x}:{:#010x}", cfg.rx_irq.addr, cfg.rx_irq.data),
        "bootstrap complete"
    );

    let device = Arc::new(SnicDevice::new(cfg, Arc::new(tap)));

    signal::install().context("install SIGINT handler")?;
    let stop = signal::caught();

    let reader = {
        let (device, tlp) = (device.clone(), tlp.clone());
        thread::Builder::new()
            .name("tap-reader".into())
            .spawn(move || run_tap_reader(&device, &*tlp, stop))
            .context("spawn tap reader")?
    };

    tlp.run(device.as_ref(), stop).context("MWr callback loop")?;

    if reader.join().is_err() {
        bail!("tap reader panicked");
    }
    info!("clean shutdown");
    Ok(())
}
