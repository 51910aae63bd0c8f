use crate::api::config_dto::SchedulerParamsDto;
use crate::state::partition::Granularity;

/// Scheduler tuning parameters, resolved from the configuration file with
/// the same defaults and clamps the scheduler applies on reconfig.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max jobs examined per cycle.
    pub default_queue_depth: u32,
    /// Per-partition examination cap; zero disables the cap.
    pub partition_job_depth: u32,
    /// Defer scheduling while inflight RPCs reach this count; zero disables.
    pub max_rpc_cnt: u32,
    /// Wall-clock cap per cycle, seconds. Clamped to [1, rpc_timeout / 2].
    pub max_sched_time: i64,
    /// Seconds between periodic cycles.
    pub sched_interval: i64,
    /// Max jobs started per cycle; zero disables.
    pub sched_max_job_start: u32,
    /// A pending job younger than this (seconds) does not poison its
    /// partition for the remainder of the cycle.
    pub bf_min_age_reserve: i64,
    /// Microseconds allowed for queue construction.
    pub build_queue_timeout: i64,
    /// Minimum seconds between scheduler invocations.
    pub batch_sched_delay: i64,
    /// Recursion bound for the dependency cycle check.
    pub max_depend_depth: u32,
    /// Seconds per gang rotation.
    pub sched_time_slice: i64,
    /// Cluster-wide gang evaluation granularity.
    pub select_granularity: Granularity,
    /// Completing jobs newer than this (seconds) suppress a cycle.
    pub complete_wait: i64,

    /// Preemption tuning, parsed out of preempt_params / sched_params.
    pub preempt_youngest_first: bool,
    pub min_exempt_priority: Option<u32>,
    pub reclaim_licenses: bool,
    pub preempt_send_user_signal: bool,

    /// Legacy compatibility: skip the completing-state cycle suppression
    /// and suppress never-runnable failure transitions.
    pub wiki_compat: bool,

    pub prolog_path: Option<String>,
    pub epilog_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            default_queue_depth: 100,
            partition_job_depth: 0,
            max_rpc_cnt: 0,
            max_sched_time: 2,
            sched_interval: 60,
            sched_max_job_start: 0,
            bf_min_age_reserve: 0,
            build_queue_timeout: 2_000_000,
            batch_sched_delay: 3,
            max_depend_depth: 10,
            sched_time_slice: 30,
            select_granularity: Granularity::Node,
            complete_wait: 0,
            preempt_youngest_first: false,
            min_exempt_priority: None,
            reclaim_licenses: false,
            preempt_send_user_signal: false,
            wiki_compat: false,
            prolog_path: None,
            epilog_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_dto(dto: &SchedulerParamsDto) -> SchedulerConfig {
        let mut cfg = SchedulerConfig::default();

        if let Some(v) = dto.default_queue_depth {
            cfg.default_queue_depth = v;
        }
        if let Some(v) = dto.partition_job_depth {
            cfg.partition_job_depth = v;
        }
        if let Some(v) = dto.max_rpc_cnt {
            cfg.max_rpc_cnt = v;
        }

        // max_sched_time is bounded below by one second and above by half
        // the RPC timeout so a cycle cannot outlive its callers.
        let rpc_timeout = dto.rpc_timeout.unwrap_or(10).max(1);
        let ceiling = (rpc_timeout / 2).max(1);
        cfg.max_sched_time = match dto.max_sched_time {
            Some(v) if v >= 1 && v <= ceiling => v,
            Some(v) => {
                log::error!("Invalid max_sched_time: {}", v);
                ceiling.min(4)
            }
            None => ceiling.min(4),
        };

        if let Some(v) = dto.sched_interval {
            if v >= 0 {
                cfg.sched_interval = v;
            } else {
                log::error!("Invalid sched_interval: {}", v);
            }
        }
        if let Some(v) = dto.sched_max_job_start {
            cfg.sched_max_job_start = v;
        }
        if let Some(v) = dto.bf_min_age_reserve {
            cfg.bf_min_age_reserve = v.max(0);
        }
        if let Some(v) = dto.build_queue_timeout {
            if v >= 100 {
                cfg.build_queue_timeout = v;
            } else {
                log::error!("Invalid build_queue_timeout: {}", v);
            }
        }
        if let Some(v) = dto.batch_sched_delay {
            if v >= 0 {
                cfg.batch_sched_delay = v;
            } else {
                log::error!("Invalid batch_sched_delay: {}", v);
            }
        }
        if let Some(v) = dto.max_depend_depth {
            cfg.max_depend_depth = v;
        }
        if let Some(v) = dto.sched_time_slice {
            if v > 0 {
                cfg.sched_time_slice = v;
            }
        }
        if let Some(v) = dto.complete_wait {
            cfg.complete_wait = v.max(0);
        }
        if let Some(gran) = &dto.select_granularity {
            cfg.select_granularity = match gran.to_ascii_lowercase().as_str() {
                "socket" => Granularity::Socket,
                "core" => Granularity::Core,
                "cpu" => Granularity::Cpu,
                "cpu2" => Granularity::Cpu2,
                _ => Granularity::Node,
            };
        }
        cfg.wiki_compat = dto.wiki_compat.unwrap_or(false);
        cfg.preempt_send_user_signal = dto.preempt_send_user_signal.unwrap_or(false);
        cfg.prolog_path = dto.prolog_path.clone();
        cfg.epilog_path = dto.epilog_path.clone();

        if let Some(params) = &dto.preempt_params {
            cfg.apply_preempt_params(params);
        }
        if let Some(params) = &dto.sched_params {
            if params.contains("preempt_youngest_first") {
                cfg.preempt_youngest_first = true;
            }
        }
        cfg
    }

    fn apply_preempt_params(&mut self, params: &str) {
        for opt in params.split(',') {
            let opt = opt.trim();
            if opt.eq_ignore_ascii_case("youngest_first") {
                self.preempt_youngest_first = true;
            } else if opt.eq_ignore_ascii_case("reclaim_licenses") {
                self.reclaim_licenses = true;
            } else if let Some(value) = opt.strip_prefix("min_exempt_priority=") {
                match value.parse::<u32>() {
                    Ok(v) => self.min_exempt_priority = Some(v),
                    Err(_) => log::error!("Invalid min_exempt_priority: {}", value),
                }
            } else if !opt.is_empty() {
                log::warn!("ignoring unknown preempt_params option: {}", opt);
            }
        }
    }
}
