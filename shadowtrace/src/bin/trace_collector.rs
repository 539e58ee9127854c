// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference trace collector: binds a namespace, accepts one client after
//! another and prints every frame it receives.

#[cfg(not(all(unix, feature = "collector")))]
fn main() {}

#[cfg(all(unix, feature = "collector"))]
fn main() -> anyhow::Result<()> {
    use shadowtrace::channel::collector::TraceCollector;
    use std::time::Duration;

    let namespace = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "default".to_string());
    let collector = TraceCollector::bind(&namespace)?;
    eprintln!("trace-collector: listening on namespace {namespace}");

    loop {
        let mut session = match collector.accept(Duration::from_secs(3600)) {
            Ok(session) => session,
            Err(error) => {
                eprintln!("trace-collector: accept failed: {error}");
                continue;
            }
        };
        eprintln!("trace-collector: client {} connected", session.peer_pid());
        loop {
            match session.read_frame(Duration::from_secs(3600)) {
                Ok(Some(frame)) => {
                    println!(
                        "[{:>5}/{:>3}] {}:{} {}",
                        frame.header.thread_id,
                        frame.header.remapped_id,
                        frame.source_path,
                        frame.header.source_line,
                        frame.message
                    );
                }
                Ok(None) => {
                    eprintln!("trace-collector: client disconnected");
                    break;
                }
                Err(error) => {
                    eprintln!("trace-collector: session error: {error}");
                    break;
                }
            }
        }
    }
}
