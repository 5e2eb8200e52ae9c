/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use ::flowparser::{
    flow_generator::FlowSummary, utils::logger::init_logger, Config, FlowId, FlowSink,
    ParserContext, SortOrder, TcpFlow, UdpFlow,
};

// flows printed from memory when interrupted
const TOP_FLOWS: usize = 10;

#[derive(Parser)]
#[clap(version, about = "Tracks TCP and UDP flows from a capture")]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long)]
    config_file: Option<PathBuf>,

    /// Capture device, or pcap file with '--file'
    #[clap(long)]
    source: Option<String>,

    /// Treat the source as a pcap file
    #[clap(long)]
    file: bool,

    /// BPF filter expression
    #[clap(long)]
    filter: Option<String>,

    #[clap(long)]
    snaplen: Option<u32>,

    /// Inactivity timeout, e.g. '15m'
    #[clap(long, parse(try_from_str = humantime::parse_duration))]
    flow_timeout: Option<Duration>,

    /// Timeout once a FIN has been seen, e.g. '30s'
    #[clap(long, parse(try_from_str = humantime::parse_duration))]
    fin_timeout: Option<Duration>,

    #[clap(long)]
    log_level: Option<String>,

    /// Order of the in-memory flow listing printed on interrupt
    #[clap(long, default_value = "none")]
    sort: SortOrder,

    /// Print completed flows as JSON lines
    #[clap(long)]
    json: bool,
}

impl Opts {
    fn apply(&self, config: &mut Config) {
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if self.file {
            config.is_file = true;
        }
        if let Some(filter) = &self.filter {
            config.filter = filter.clone();
        }
        if let Some(snaplen) = self.snaplen {
            config.snaplen = snaplen;
        }
        if let Some(timeout) = self.flow_timeout {
            config.flow_timeout = timeout;
        }
        if let Some(timeout) = self.fin_timeout {
            config.fin_timeout = timeout;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[derive(Serialize)]
struct FlowRecord<'a> {
    id: &'a FlowId,
    #[serde(flatten)]
    summary: FlowSummary,
}

struct PrintSink {
    json: bool,
}

impl PrintSink {
    fn print(&self, id: &FlowId, summary: FlowSummary) {
        if self.json {
            match serde_json::to_string(&FlowRecord { id, summary }) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("serialize flow {} failed: {}", id, e),
            }
        } else {
            println!(
                "{} pkts={} bytes={} first={} last={}",
                id, summary.size_pkts, summary.size_bytes, summary.first_rx, summary.last_rx
            );
        }
    }
}

impl FlowSink for PrintSink {
    fn on_tcp_flow(&self, id: &FlowId, flow: &TcpFlow) {
        self.print(id, flow.base().summary());
    }

    fn on_udp_flow(&self, id: &FlowId, flow: &UdpFlow) {
        self.print(id, flow.base().summary());
    }

    fn on_stop(&self) {
        info!("all flows dumped");
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = match &opts.config_file {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    opts.apply(&mut config);
    let _logger = init_logger(&config.log_level, config.log_file.as_deref())?;

    let context = Arc::new(ParserContext::new(&config)?);
    let sink = Arc::new(PrintSink { json: opts.json });
    context.set_sink(&sink);
    context.start()?;

    let mut signals = Signals::new(TERM_SIGNALS)?;
    let handle = signals.handle();
    // end of file stops the parser on its own, release the signal loop then
    let waiter = {
        let context = context.clone();
        thread::Builder::new()
            .name("stop-waiter".to_owned())
            .spawn(move || {
                context.wait();
                handle.close();
            })?
    };
    if let Some(signal) = signals.forever().next() {
        info!("received signal {}", signal);
        for view in context.snapshot(opts.sort).into_iter().take(TOP_FLOWS) {
            if let Some(summary) = view.summary() {
                info!(
                    "{} pkts={} bytes={} pps={:.1} bps={:.1}",
                    view.id(),
                    summary.size_pkts,
                    summary.size_bytes,
                    summary.pps,
                    summary.bps
                );
            }
        }
    }
    context.stop();
    let _ = waiter.join();

    println!("{}", serde_json::to_string_pretty(&context.stats())?);
    Ok(())
}
