// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::create_dir_all;
use std::fs::File;
use std::path::Path;

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use log::info;
use log::warn;
use statrs::statistics::Data;
use statrs::statistics::Distribution;
use statrs::statistics::Max;
use statrs::statistics::Min;
use statrs::statistics::OrderStatistics;

use tcp_recovery::CongestionControlAlgorithm;
use tcp_recovery::Config;
use tcp_recovery_tools::LinkModel;
use tcp_recovery_tools::Report;
use tcp_recovery_tools::Result;
use tcp_recovery_tools::Simulation;
use tcp_recovery_tools::SimulationOpt;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(name = "tcp-recovery-sim")]
pub struct SimOpt {
    /// Number of segments to transfer.
    #[clap(short, long, default_value = "1000", value_name = "NUM")]
    pub segments: u32,

    /// Maximum segment size in bytes.
    #[clap(long, default_value = "1460", value_name = "NUM")]
    pub mss: u32,

    /// Receive window in bytes.
    #[clap(long, default_value = "262144", value_name = "NUM")]
    pub window: u32,

    /// Initial sequence number.
    #[clap(long, default_value = "0", value_name = "NUM")]
    pub isn: u32,

    /// One way delay of the path in milliseconds.
    #[clap(short, long, default_value = "50", value_name = "TIME")]
    pub delay: u64,

    /// Maximum random extra delay of data segments in milliseconds.
    #[clap(short, long, default_value = "0", value_name = "TIME")]
    pub jitter: u64,

    /// Drop probability of data segments.
    #[clap(short, long, default_value = "0.01", value_name = "RATE")]
    pub loss: f64,

    /// Drop probability of ACKs.
    #[clap(long, default_value = "0", value_name = "RATE")]
    pub ack_loss: f64,

    /// Delayed ACK timeout of the receiver in milliseconds, "0" to ACK every segment.
    #[clap(long, default_value = "40", value_name = "TIME")]
    pub delayed_ack: u64,

    /// Seed of the random generator.
    #[clap(long, default_value = "1", value_name = "NUM")]
    pub seed: u64,

    /// Number of runs, each with the next seed.
    #[clap(short, long, default_value = "1", value_name = "NUM")]
    pub runs: u64,

    /// Give up on a run after this many seconds of simulated time.
    #[clap(long, default_value = "3600", value_name = "TIME")]
    pub time_limit: u64,

    /// Congestion control algorithm.
    #[clap(long, default_value = "RENO")]
    pub congestion_control_algor: CongestionControlAlgorithm,

    /// Initial congestion window in segments, "0" to derive it from the MSS.
    #[clap(long, default_value = "0", value_name = "NUM")]
    pub initial_congestion_window: u32,

    /// Initial reordering threshold in segments.
    #[clap(long, default_value = "3", value_name = "NUM")]
    pub reordering: u32,

    /// Disable SACK.
    #[clap(long)]
    pub disable_sack: bool,

    /// Disable forward acknowledgment.
    #[clap(long)]
    pub disable_fack: bool,

    /// Disable D-SACK based undo.
    #[clap(long)]
    pub disable_dsack: bool,

    /// Print the recovery statistics of each run as JSON.
    #[clap(long)]
    pub print_stats: bool,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "INFO", value_name = "STR")]
    pub log_level: log::LevelFilter,

    /// Log file path. If no file is specified, logs will be written to `stderr`.
    #[clap(long, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Save qlog file (<seed>.qlog) of each run to the specified directory.
    #[clap(long, value_name = "DIR")]
    pub qlog_dir: Option<String>,
}

fn new_config(option: &SimOpt) -> Result<Config> {
    let mut conf = Config::new()?;
    conf.set_mss(option.mss);
    conf.set_initial_congestion_window(option.initial_congestion_window);
    conf.set_reordering(option.reordering);
    conf.set_congestion_control_algorithm(option.congestion_control_algor);
    conf.enable_sack(!option.disable_sack);
    conf.enable_fack(!option.disable_fack);
    conf.enable_dsack(!option.disable_dsack);
    conf.validate()?;
    Ok(conf)
}

fn run(option: &SimOpt, conf: &Config, seed: u64) -> Result<Report> {
    let opt = SimulationOpt {
        segments: option.segments,
        window: option.window,
        isn: option.isn,
        seed,
        time_limit: option.time_limit * 1000,
        delayed_ack: option.delayed_ack,
        link: LinkModel {
            delay: option.delay,
            jitter: option.jitter,
            loss: option.loss,
            ack_loss: option.ack_loss,
        },
    };

    let mut sim = Simulation::new(conf, opt);
    if let Some(qlog_dir) = &option.qlog_dir {
        let path = Path::new(qlog_dir).join(format!("{}.qlog", seed));
        let file = File::create(&path)?;
        sim.set_qlog(file);
    }

    let report = sim.run();
    info!(
        "run seed={} completed={} duration={:?} transmissions={} dropped={} retrans={}",
        seed,
        report.completed,
        report.duration,
        report.transmissions,
        report.dropped,
        report.stats.total_retrans
    );
    if !report.completed {
        warn!("run seed={} gave up after {:?}", seed, report.duration);
    }
    if option.print_stats {
        println!("{}", serde_json::to_string_pretty(&report.stats)?);
    }
    Ok(report)
}

fn print_summary(reports: &[Report]) {
    let completed = reports.iter().filter(|r| r.completed).count();
    let delivered: u64 = reports.iter().map(|r| r.delivered).sum();
    let transmissions: u64 = reports.iter().map(|r| r.transmissions).sum();
    let retrans: u64 = reports.iter().map(|r| r.stats.total_retrans).sum();
    let acks: u64 = reports.iter().map(|r| r.acks).sum();
    let timeouts: u64 = reports.iter().map(|r| r.stats.timeouts).sum();
    let undos: u64 = reports
        .iter()
        .map(|r| r.stats.full_undo + r.stats.partial_undo + r.stats.dsack_undo + r.stats.loss_undo)
        .sum();

    println!();
    println!("runs: total {}, completed {}", reports.len(), completed);
    println!(
        "segments: sent {}, retransmitted {}, timeouts {}, undos {}, acks {}",
        transmissions, retrans, timeouts, undos, acks
    );

    let goodput: Vec<f64> = reports
        .iter()
        .filter(|r| !r.duration.is_zero())
        .map(|r| r.delivered as f64 * 8.0 / r.duration.as_secs_f64() / 1000.0)
        .collect();
    if !goodput.is_empty() {
        let s = Data::new(goodput);
        println!(
            "goodput(kbit/s): min: {:.2}, max: {:.2}, mean: {:.2}",
            s.min(),
            s.max(),
            s.mean().unwrap_or(0.0),
        );
    }

    let cwnd: Vec<f64> = reports
        .iter()
        .flat_map(|r| r.cwnd_samples.iter().copied())
        .collect();
    if !cwnd.is_empty() {
        let mut s = Data::new(cwnd);
        println!("cwnd(segments):");
        println!(
            "\tmin: {:.2}, max: {:.2}, mean: {:.2}, sd: {:.2}",
            s.min(),
            s.max(),
            s.mean().unwrap_or(0.0),
            s.std_dev().unwrap_or(0.0),
        );
        println!(
            "\tmedian: {:.2}, p10: {:.2}, p90: {:.2}",
            s.median(),
            s.percentile(10),
            s.percentile(90),
        );
    }
    println!("delivered bytes: {}", delivered);
}

fn parse_option() -> std::result::Result<SimOpt, clap::error::Error> {
    let option = SimOpt::parse();

    for rate in [option.loss, option.ack_loss] {
        if !(0.0..1.0).contains(&rate) {
            return Err(SimOpt::command().error(
                ErrorKind::InvalidValue,
                "Drop probability must be in [0, 1)",
            ));
        }
    }

    if option.segments == 0 || option.runs == 0 {
        return Err(SimOpt::command().error(
            ErrorKind::InvalidValue,
            "Specify at least one segment and one run",
        ));
    }

    Ok(option)
}

fn process_option(option: &SimOpt) -> Result<()> {
    env_logger::builder()
        .target(tcp_recovery_tools::log_target(&option.log_file)?)
        .filter_level(option.log_level)
        .format_timestamp_millis()
        .init();

    if let Some(qlog_dir) = &option.qlog_dir {
        if let Err(e) = create_dir_all(qlog_dir) {
            warn!("create qlog directory {} error: {:?}", qlog_dir, e);
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let option = match parse_option() {
        Ok(option) => option,
        Err(e) => e.exit(),
    };
    process_option(&option)?;

    let conf = new_config(&option)?;
    let mut reports = Vec::with_capacity(option.runs as usize);
    for i in 0..option.runs {
        reports.push(run(&option, &conf, option.seed + i)?);
    }

    print_summary(&reports);
    Ok(())
}
