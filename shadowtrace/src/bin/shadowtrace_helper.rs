// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(all(unix, feature = "helper")))]
fn main() {}

#[cfg(all(unix, feature = "helper"))]
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = shadowtrace::rendezvous::helper::HelperArgs::parse(&args)?;
    shadowtrace::rendezvous::helper::helper_entry_point(args)
}
