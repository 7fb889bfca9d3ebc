use eyre::{Context, Result, bail};
use nix::unistd::Uid;

/// Parse a fio style data size (`4k`, `16M`, `100g`, plain bytes, with an
/// optional `b`/`ib` suffix) into bytes.
pub fn parse_data_size(size: &str) -> Result<u64> {
    let normalized = size.trim().to_lowercase();
    let body = normalized
        .strip_suffix("ib")
        .or_else(|| normalized.strip_suffix('b'))
        .unwrap_or(&normalized);
    let multiplier: u64 = match body.chars().last() {
        Some('k') => 1 << 10,
        Some('m') => 1 << 20,
        Some('g') => 1 << 30,
        Some('t') => 1 << 40,
        Some(c) if c.is_ascii_digit() => 1,
        _ => bail!("unsupported data size {size:?}"),
    };
    let digits = body.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let value: f64 = digits
        .parse()
        .context(format!("parse data size {size:?}"))?;
    if value < 0.0 {
        bail!("negative data size {size:?}");
    }
    Ok((value * multiplier as f64) as u64)
}

/// Fail unless the process runs with an effective uid of root.
pub fn require_root(what: &str) -> Result<()> {
    if !Uid::effective().is_root() {
        bail!("root privileges are needed to {what}");
    }
    Ok(())
}
