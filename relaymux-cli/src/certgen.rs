// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// `<base>.pub.pem` and `<base>.priv.pem` beside `base`
fn pem_paths(base: &Path) -> Result<(PathBuf, PathBuf)> {
  let stem = base
    .file_name()
    .and_then(|name| name.to_str())
    .context("Certificate path must end in a UTF-8 file name")?;
  Ok((
    base.with_file_name(format!("{}.pub.pem", stem)),
    base.with_file_name(format!("{}.priv.pem", stem)),
  ))
}

#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let (public_path, private_path) = pem_paths(&path)?;
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(&public_path, &public_pem).context("Failed writing public key")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(public = ?public_path, private = ?private_path, "Certificates written");
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::path::Path;

  #[test]
  fn pem_paths_extend_the_file_name() {
    let (public, private) = super::pem_paths(Path::new("certs/relay")).unwrap();
    assert_eq!(public, Path::new("certs/relay.pub.pem"));
    assert_eq!(private, Path::new("certs/relay.priv.pem"));
  }
}
