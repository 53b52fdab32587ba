//! Loads address ranges from stdin into a pair of nftables sets.
//!
//! Each input line is an IPv4 or IPv6 address, optionally with a prefix
//! length. Host bits are masked off, each family is collapsed to the minimal
//! list of covering networks, and one `nft add element` call is made per
//! non-empty family.

use clap::Parser;
use std::io::{self, BufRead};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "llmbox-nft-sets", about = "Add address ranges from stdin to nft sets")]
struct Args {
    table: String,
    v4_set: String,
    v6_set: String,
    #[arg(long, default_value = "nft")]
    nft: String,
}

#[derive(Debug, Error)]
enum NftSetsError {
    #[error("line {line}: invalid address '{text}': {reason}")]
    InvalidAddress {
        line: usize,
        text: String,
        reason: String,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status}")]
    CommandFailed { command: String, status: i32 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    fn render(self, network: u128, prefix: u32) -> String {
        match self {
            // v4 networks never exceed 32 bits
            Family::V4 => format!("{}/{prefix}", Ipv4Addr::from(network as u32)),
            Family::V6 => format!("{}/{prefix}", Ipv6Addr::from(network)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    family: Family,
    address: u128,
    prefix: u32,
}

impl Network {
    fn last(&self) -> u128 {
        self.address | host_mask(self.family.bits() - self.prefix)
    }
}

fn host_mask(host_bits: u32) -> u128 {
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

fn parse_network(text: &str) -> Result<Network, String> {
    let (addr_text, prefix_text) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (text, None),
    };
    let addr: IpAddr = addr_text.parse().map_err(|err| format!("{err}"))?;
    let (family, raw) = match addr {
        IpAddr::V4(v4) => (Family::V4, u128::from(u32::from(v4))),
        IpAddr::V6(v6) => (Family::V6, u128::from(v6)),
    };
    let bits = family.bits();
    let prefix = match prefix_text {
        None => bits,
        Some(p) => p
            .parse::<u32>()
            .ok()
            .filter(|p| *p <= bits)
            .ok_or_else(|| format!("prefix length must be between 0 and {bits}"))?,
    };
    Ok(Network {
        family,
        address: raw & !host_mask(bits - prefix) & host_mask(bits),
        prefix,
    })
}

/// Minimal list of networks covering exactly the union of `networks`.
fn collapse(family: Family, networks: &[Network]) -> Vec<(u128, u32)> {
    let mut ranges: Vec<(u128, u128)> = networks
        .iter()
        .filter(|n| n.family == family)
        .map(|n| (n.address, n.last()))
        .collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, last_end)) if *last_end == u128::MAX || start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }

    let bits = family.bits();
    let mut out = Vec::new();
    for (start, end) in merged {
        split_range(start, end, bits, &mut out);
    }
    out
}

fn split_range(mut start: u128, end: u128, bits: u32, out: &mut Vec<(u128, u32)>) {
    loop {
        let aligned = if start == 0 {
            bits
        } else {
            start.trailing_zeros().min(bits)
        };
        let span = end - start;
        let fits = if span == u128::MAX {
            128
        } else {
            127 - (span + 1).leading_zeros()
        };
        let host_bits = aligned.min(fits);
        out.push((start, bits - host_bits));
        let last = start | host_mask(host_bits);
        if last >= end {
            return;
        }
        start = last + 1;
    }
}

fn read_networks(input: impl BufRead) -> Result<Vec<Network>, NftSetsError> {
    let mut networks = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let network = parse_network(text).map_err(|reason| NftSetsError::InvalidAddress {
            line: idx + 1,
            text: text.to_string(),
            reason,
        })?;
        networks.push(network);
    }
    Ok(networks)
}

fn add_elements(args: &Args, set: &str, ranges: &[String]) -> Result<(), NftSetsError> {
    let argv = [args.nft.as_str(), "add", "element", "inet", args.table.as_str(), set];
    let command = argv.join(" ");
    println!("Running {command} with {} range(s)", ranges.len());
    let status = Command::new(argv[0])
        .args(&argv[1..])
        .arg(format!("{{{}}}", ranges.join(",")))
        .status()
        .map_err(|source| NftSetsError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !status.success() {
        return Err(NftSetsError::CommandFailed {
            command,
            status: status.code().unwrap_or(1),
        });
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), NftSetsError> {
    let networks = read_networks(io::stdin().lock())?;
    for (family, set) in [(Family::V4, &args.v4_set), (Family::V6, &args.v6_set)] {
        let ranges: Vec<String> = collapse(family, &networks)
            .into_iter()
            .map(|(address, prefix)| family.render(address, prefix))
            .collect();
        if ranges.is_empty() {
            continue;
        }
        add_elements(args, set, &ranges)?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
