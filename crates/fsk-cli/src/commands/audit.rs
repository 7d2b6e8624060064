use std::path::Path;

use anyhow::{bail, Result};
use fsk_audit::{read_entries, verify_hash_chain, VerifyResult};

pub fn verify(path: &Path) -> Result<()> {
    match verify_hash_chain(path)? {
        VerifyResult::Valid { lines } => {
            println!("audit_chain=valid lines={}", lines);
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            bail!("AUDIT_CHAIN_BROKEN line={} reason={}", line, reason)
        }
    }
}

pub fn show(path: &Path, order_id: &str) -> Result<()> {
    let entries = read_entries(path)?;
    let mut n = 0usize;
    for e in entries.iter().filter(|e| e.order_id == order_id) {
        n += 1;
        println!(
            "{} seq={} action={} actor={} details={}",
            e.ts_utc.to_rfc3339(),
            e.seq,
            e.action.as_str(),
            serde_json::to_string(&e.actor)?.trim_matches('"'),
            e.details
        );
    }
    if n == 0 {
        println!("no entries for order_id={}", order_id);
    }
    Ok(())
}
