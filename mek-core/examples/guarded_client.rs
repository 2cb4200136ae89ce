//! # MEK Guarded Client Demo
//!
//! Walks a client through the whole kernel surface: registration, grant
//! issuance, a refused admission, a successful admission with friction,
//! revocation, and evidence export with verification.
//!
//! Run with: cargo run --example guarded_client

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use mek_core::*;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("=== MEK guarded client demo ===\n");

    let kernel = Kernel::new(KernelConfig::default());

    // 1. Register a capability once, at startup
    println!("registering capability file.read (MEDIUM, requires {{path}})...");
    kernel
        .register(CapabilityContract::new(
            "file.read",
            Consequence::Medium,
            ["path".to_string()],
            |ctx| {
                Ok(serde_json::json!({
                    "path": ctx.fields().get("path"),
                    "bytes": 128,
                }))
            },
        ))
        .map_err(|e| format!("registration refused: {e}"))?;

    // 2. An admission without any grant refuses at the door
    println!("executing without a grant...");
    let ctx = kernel.new_context(
        PrincipalId::new("alice"),
        "file.read",
        Some(0.9),
        path_fields("/tmp/notes.txt"),
    )?;
    let refused = kernel.execute("file.read", ctx);
    println!(
        "   refused as expected: {:?}\n",
        refused.failure_type().unwrap()
    );

    // 3. Authority comes from outside the admission path
    println!("issuing a single-use 60s grant to alice...");
    let grant = kernel.issue_grant(
        PrincipalId::new("alice"),
        "file.read",
        GrantScope(serde_json::json!({"prefix": "/tmp/"})),
        Duration::from_secs(60),
        Some(1),
        true,
    )?;
    println!("   grant {} issued\n", grant.grant_id);

    // 4. The same call now admits, after the MEDIUM friction delay
    println!("executing with the grant (expect a ~3s wait)...");
    let ctx = kernel.new_context(
        PrincipalId::new("alice"),
        "file.read",
        Some(0.9),
        path_fields("/tmp/notes.txt"),
    )?;
    let started = Instant::now();
    let result = kernel.execute("file.read", ctx);
    println!(
        "   admitted after {:.1}s, remaining uses: {:?}\n",
        started.elapsed().as_secs_f64(),
        grant.remaining_uses()
    );

    // 5. Every halt leaves a hash-chained, attested bundle
    let bundle_id = result.bundle_id().expect("terminal halts seal a bundle");
    let bytes = kernel.export(bundle_id)?;
    println!("exported bundle {} ({} bytes)", bundle_id, bytes.len());
    println!("   verify: {:?}", Kernel::verify(&bytes));

    let mut tampered = bytes.clone();
    let last = tampered.len() - 20;
    tampered[last] ^= 0x01;
    println!("   verify after one flipped byte: {:?}\n", Kernel::verify(&tampered));

    // 6. Revocation is terminal
    println!("revoking the grant...");
    kernel.revoke(
        grant.grant_id,
        PrincipalId::new("operator"),
        RevocationReason::ManualRevocation,
    )?;
    println!(
        "   revocation recorded: {:?}",
        kernel.revocation_of(grant.grant_id).map(|r| r.reason)
    );

    Ok(())
}

fn path_fields(path: &str) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    fields.insert("path".to_string(), FieldValue::str(path));
    fields
}
