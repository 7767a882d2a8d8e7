use clap::Parser;
use config::{Config, CpuTrigger, GcMemoryTrigger, MemoryTrigger, TargetSelector};
use std::path::PathBuf;
use std::time::Duration;

/// Command line interface for procdump-rs.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// CPU threshold (percent) above which to create a dump.
    #[arg(short = 'c', long, value_name = "PERCENT")]
    pub cpu: Option<u32>,

    /// CPU threshold (percent) below which to create a dump.
    #[arg(long, value_name = "PERCENT", conflicts_with = "cpu")]
    pub cpu_below: Option<u32>,

    /// Memory commit threshold(s) in MB above which to create dumps. With
    /// several thresholds the i-th dump uses the i-th value.
    #[arg(short = 'm', long, value_name = "MB[,MB...]", value_delimiter = ',')]
    pub memory: Vec<u64>,

    /// Memory commit threshold(s) in MB below which to create dumps.
    #[arg(
        long,
        value_name = "MB[,MB...]",
        value_delimiter = ',',
        conflicts_with = "memory"
    )]
    pub memory_below: Vec<u64>,

    /// Thread count threshold above which to create a dump.
    #[arg(long, value_name = "COUNT")]
    pub threads: Option<u64>,

    /// File descriptor count threshold above which to create a dump.
    #[arg(long, value_name = "COUNT")]
    pub fds: Option<u64>,

    /// Comma separated signal number(s); delivery of any of them triggers
    /// a dump (attaches via ptrace).
    #[arg(long, value_name = "SIG[,SIG...]", value_delimiter = ',')]
    pub signals: Vec<i32>,

    /// [.NET] Create a dump when the process encounters an exception.
    #[arg(short = 'e', long)]
    pub exception: bool,

    /// [.NET] Filter (include) on exception content, comma separated;
    /// wildcards (*) are supported.
    #[arg(long, value_name = "FILTER")]
    pub exception_filter: Option<String>,

    /// [.NET] GC memory threshold(s): `[generation:|loh:|poh:]MB[,MB...]`
    /// (default is total managed memory usage).
    #[arg(long, value_name = "SPEC")]
    pub gc_memory: Option<String>,

    /// [.NET] Dump when a collection of this generation starts and when it
    /// finishes.
    #[arg(long, value_name = "GEN")]
    pub gc_generation: Option<u8>,

    /// Enable memory leak tracking (malloc family of APIs).
    #[arg(long)]
    pub restrack: bool,

    /// With --restrack: only produce leak reports, never dumps.
    #[arg(long, requires = "restrack")]
    pub restrack_nodump: bool,

    /// Sample rate when using --restrack.
    #[arg(long, value_name = "RATE")]
    pub sample_rate: Option<u32>,

    /// Filter (exclude) on restrack call stacks; wildcards (*) supported.
    #[arg(long, value_name = "FILTER")]
    pub exclude_filter: Option<String>,

    /// Number of dumps to write before exiting.
    #[arg(short = 'n', long, value_name = "COUNT")]
    pub number: Option<u32>,

    /// Consecutive seconds a trigger must hold before a dump is written
    /// (default 10).
    #[arg(short = 's', long, value_name = "SECONDS")]
    pub seconds: Option<u64>,

    /// Trigger polling interval in milliseconds (default 1000).
    #[arg(long, value_name = "MS")]
    pub polling_interval: Option<u64>,

    /// Custom coredump filter mask (hex) selecting what memory the core
    /// includes; see core(5).
    #[arg(long, value_name = "MASK")]
    pub core_dump_mask: Option<String>,

    /// Overwrite an existing dump file.
    #[arg(short = 'o', long)]
    pub overwrite: bool,

    /// Wait for a process with the given name to launch.
    #[arg(short = 'w', long)]
    pub wait: bool,

    /// The numeric target is a process group id.
    #[arg(short = 'g', long)]
    pub pgid: bool,

    /// External core-producing helper to invoke.
    #[arg(long, value_name = "PROGRAM", default_value = "gcore")]
    pub helper: PathBuf,

    /// Delay in milliseconds between helper completion and probing for the
    /// core file (needed on WSL2).
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub helper_settle_ms: u64,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Target: a PID (a PGID with --pgid), or a process name.
    #[arg(value_name = "TARGET")]
    pub target: String,

    /// Dump file base name or output directory (default ".").
    #[arg(value_name = "OUTPUT")]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Map the argv surface onto the validated configuration record.
    pub fn into_config(self) -> Result<Config, config::Error> {
        let target = parse_target(&self.target, self.pgid, self.wait)?;
        let mut config = Config::new(target);

        if let Some(percent) = self.cpu {
            config.cpu = Some(CpuTrigger {
                percent,
                below: false,
            });
        }
        if let Some(percent) = self.cpu_below {
            config.cpu = Some(CpuTrigger {
                percent,
                below: true,
            });
        }
        if !self.memory.is_empty() {
            config.memory = Some(MemoryTrigger {
                thresholds_mb: self.memory,
                below: false,
            });
        }
        if !self.memory_below.is_empty() {
            config.memory = Some(MemoryTrigger {
                thresholds_mb: self.memory_below,
                below: true,
            });
        }
        config.thread_count = self.threads;
        config.fd_count = self.fds;
        config.signals = self.signals;
        config.exception = self.exception;
        config.exception_filter = self.exception_filter;
        if let Some(spec) = &self.gc_memory {
            config.gc_memory = Some(GcMemoryTrigger::parse(spec)?);
        }
        config.gc_generation = self.gc_generation;
        config.restrack = self.restrack;
        config.restrack_dump = !self.restrack_nodump;
        config.sample_rate = self.sample_rate;
        config.exclude_filter = self.exclude_filter;
        config.dumps = self.number;
        config.threshold_seconds = self.seconds;
        config.polling = self.polling_interval.map(Duration::from_millis);
        if let Some(mask) = &self.core_dump_mask {
            config.core_dump_mask = Some(config::parse_mask(mask)?);
        }
        config.overwrite = self.overwrite;
        config.helper = self.helper;
        config.helper_settle = Duration::from_millis(self.helper_settle_ms);
        if let Some(output) = self.output {
            apply_output(&mut config, output)?;
        }

        config.validate()?;
        config.apply_defaults();
        Ok(config)
    }
}

fn parse_target(raw: &str, pgid: bool, wait: bool) -> Result<TargetSelector, config::Error> {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        let pid: i32 = raw
            .parse()
            .map_err(|_| config::Error::InvalidTarget(raw.to_string()))?;
        if pid < 1 {
            return Err(config::Error::InvalidTarget(raw.to_string()));
        }
        if wait {
            return Err(config::Error::WaitRequiresName);
        }
        return Ok(if pgid {
            TargetSelector::ProcessGroup(pid)
        } else {
            TargetSelector::Pid(pid)
        });
    }
    Ok(TargetSelector::Name {
        name: raw.to_string(),
        wait,
    })
}

/// An existing directory (or a trailing `/`) selects default naming inside
/// it; anything else is split into directory + custom base name.
fn apply_output(config: &mut Config, output: PathBuf) -> Result<(), config::Error> {
    let ends_with_slash = output
        .as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR);
    if output.is_dir() || ends_with_slash {
        if !output.is_dir() {
            return Err(config::Error::InvalidDumpDirectory(output));
        }
        config.dump_path = output;
        config.dump_name = None;
        return Ok(());
    }

    let directory = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !directory.is_dir() {
        return Err(config::Error::InvalidDumpDirectory(directory));
    }
    let name = output
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| config::Error::InvalidDumpDirectory(output.clone()))?;
    config.dump_path = directory;
    config.dump_name = Some(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_target_is_a_pid() {
        assert_eq!(parse_target("1234", false, false).unwrap(), TargetSelector::Pid(1234));
        assert_eq!(
            parse_target("1234", true, false).unwrap(),
            TargetSelector::ProcessGroup(1234)
        );
        assert!(parse_target("0", false, false).is_err());
    }

    #[test]
    fn wait_requires_a_name_target() {
        assert!(matches!(
            parse_target("1234", false, true),
            Err(config::Error::WaitRequiresName)
        ));
        assert_eq!(
            parse_target("myapp", false, true).unwrap(),
            TargetSelector::Name {
                name: "myapp".into(),
                wait: true
            }
        );
    }

    #[test]
    fn output_directory_vs_custom_name() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::new(TargetSelector::Pid(1));
        apply_output(&mut config, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.dump_path, dir.path());
        assert_eq!(config.dump_name, None);

        let mut config = Config::new(TargetSelector::Pid(1));
        apply_output(&mut config, dir.path().join("crash")).unwrap();
        assert_eq!(config.dump_path, dir.path());
        assert_eq!(config.dump_name, Some("crash".into()));

        let mut config = Config::new(TargetSelector::Pid(1));
        assert!(apply_output(&mut config, PathBuf::from("/no/such/dir/crash")).is_err());
    }

    #[test]
    fn full_flag_surface_maps_onto_the_config() {
        let cli = Cli::parse_from([
            "procdump-rs",
            "-c",
            "85",
            "-n",
            "2",
            "-s",
            "5",
            "--polling-interval",
            "250",
            "--core-dump-mask",
            "0x3F",
            "--helper-settle-ms",
            "0",
            "-o",
            "4321",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.target, TargetSelector::Pid(4321));
        assert_eq!(
            config.cpu,
            Some(CpuTrigger {
                percent: 85,
                below: false
            })
        );
        assert_eq!(config.dumps, Some(2));
        assert_eq!(config.threshold_seconds, Some(5));
        assert_eq!(config.polling, Some(Duration::from_millis(250)));
        assert_eq!(config.core_dump_mask, Some(0x3f));
        assert!(config.overwrite);
        assert!(config.helper_settle.is_zero());
        assert!(!config.timer);
    }

    #[test]
    fn multi_memory_thresholds_fix_the_dump_count() {
        let cli = Cli::parse_from(["procdump-rs", "-m", "100,200,300", "4321"]);
        let config = cli.into_config().unwrap();
        assert_eq!(
            config.memory,
            Some(MemoryTrigger {
                thresholds_mb: vec![100, 200, 300],
                below: false
            })
        );
        assert_eq!(config.dumps, Some(3));
    }

    #[test]
    fn bare_invocation_falls_back_to_the_timer() {
        let cli = Cli::parse_from(["procdump-rs", "4321"]);
        let config = cli.into_config().unwrap();
        assert!(config.timer);
        assert_eq!(config.dumps, Some(config::DEFAULT_NUMBER_OF_DUMPS));
    }
}
