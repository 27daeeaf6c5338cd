//! Human-readable output

use warden_core::{Circuit, Connectivity, HealthLevel, RotationOutcome, StatusReport};

fn icon(level: HealthLevel) -> &'static str {
    match level {
        HealthLevel::Healthy => "✅",
        HealthLevel::Degraded => "⚠️ ",
        HealthLevel::Unhealthy => "❌",
    }
}

pub fn pid(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub fn status(report: &StatusReport) {
    println!(
        "🧅 Tor Warden status ({})\n",
        report.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );

    for finding in &report.findings {
        println!("   {} {}", icon(finding.level), finding.detail);
    }

    println!();
    println!("   Process:  {} (pid {})", report.lifecycle, pid(report.pid));
    if let Connectivity::Tested { routed, .. } = &report.connectivity {
        if let Some(address) = &routed.observed_address {
            println!("   Exit IP:  {}", address);
        }
        if let Some(latency) = routed.latency_ms {
            println!("   Latency:  {} ms", latency);
        }
    }
    if let Some(count) = report.circuit_count {
        println!("   Circuits: {} built", count);
    }
    if let Some(geo) = &report.geolocation {
        println!("   Location: {}, {}, {}", geo.city, geo.region, geo.country);
        println!("   Network:  {} ({})", geo.org, geo.timezone);
    }

    if report.leak_detected() {
        println!("\n🚨 LEAK DETECTED: traffic is not anonymized");
    }

    println!(
        "\n{} Overall: {}",
        icon(report.overall),
        report.overall.to_string().to_uppercase()
    );
}

pub fn rotation(outcome: &RotationOutcome) {
    let previous = outcome.previous.address.as_deref().unwrap_or("unknown");
    let current = outcome.current.address.as_deref().unwrap_or("unknown");

    if outcome.changed {
        println!("✅ New identity: {} → {}", previous, current);
    } else {
        println!("❌ Exit address did not change ({} → {})", previous, current);
        println!("   Tor rate-limits NEWNYM; wait a few seconds and retry");
    }
}

pub fn connectivity(connectivity: &Connectivity) {
    match connectivity {
        Connectivity::NotAttempted { reason } => {
            println!("❌ Not attempted: {}", reason);
            println!("   Is Tor running? Try: tor-warden start");
        },
        Connectivity::Tested { routed, leak } => {
            for finding in connectivity.findings() {
                println!("   {} {}", icon(finding.level), finding.detail);
            }
            if let Some(address) = &routed.observed_address {
                println!("\n   Tor exit:   {}", address);
            }
            if let Some(address) = &leak.direct_address {
                println!("   Direct IP:  {}", address);
            }
            if let Some(latency) = routed.latency_ms {
                println!("   Latency:    {} ms", latency);
            }
            if leak.leak_detected {
                println!("\n🚨 LEAK DETECTED: routed and direct traffic share an address");
            }
        },
    }
}

pub fn circuits(circuits: &[Circuit]) {
    if circuits.is_empty() {
        println!("ℹ️  No built circuits");
        return;
    }

    println!("🔗 {} built circuit(s)\n", circuits.len());
    for circuit in circuits {
        println!(
            "   Circuit {} ({})",
            circuit.id,
            circuit.purpose.as_deref().unwrap_or("unknown purpose")
        );
        for (hop, relay) in circuit.path.iter().enumerate() {
            println!(
                "     {}. {} ${}",
                hop + 1,
                relay.nickname.as_deref().unwrap_or("Unknown"),
                relay.fingerprint
            );
        }
    }
}
