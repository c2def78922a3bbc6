//! The analysis pipeline: load, replay, finalize, extract.

use crate::config::Config;
use crate::error::DriverError;
use crate::source;
use serde::Serialize;
use smtrace_core::backend::KernelBackend;
use smtrace_core::timing::Measurement;
use smtrace_core::{
    FieldResolver, GroupStats, InstanceGroup, InstanceReport, KernelLog, Model, Segment,
    StatusValue, TimingContext, TraceEvent, VariableIntervalProducer,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// State of one adaptive constraint after finalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveSummary {
    pub constraint: String,
    pub samples: usize,
    /// Learned form of the constraint, if a decision was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub model: String,
    pub checksum: String,
    pub strategy: &'static str,
    pub stats: GroupStats,
    pub valid_instances: usize,
    pub invalid_instances: usize,
    pub adaptive: Vec<AdaptiveSummary>,
    pub dropped_verdicts: usize,
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceReport>,
    pub timings: Vec<Measurement>,
}

impl Analysis {
    pub fn invalid_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.status() == StatusValue::Invalid)
    }

    /// Writes the segments as a JSON array.
    pub fn write_segments(&self, path: impl AsRef<Path>) -> Result<(), DriverError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.segments)?;
        std::fs::write(path, json).map_err(|e| DriverError::io(path, e))
    }
}

/// Runs the whole pipeline from the files named by `config`.
pub fn run(config: &Config) -> Result<Analysis, DriverError> {
    config.validate()?;
    let input = &config.input;

    let mut timing = TimingContext::new();
    let (model, events, kernel) = {
        let mut scope = timing.scope("load");
        let model_path = input
            .model
            .as_ref()
            .ok_or(DriverError::MissingInput("model"))?;
        let model = source::load_model(model_path)?;
        let events = source::load_events(input)?;
        let kernel = input
            .kernel_log
            .as_ref()
            .map(source::load_kernel_log)
            .transpose()?;
        scope.set_items(events.len() as u64);
        (model, events, kernel)
    };

    analyze(
        Arc::new(model),
        events,
        kernel.map(Arc::new),
        config,
        timing,
    )
}

/// Replays `events` through a group of `model` and extracts its segments.
pub fn analyze<I>(
    model: Arc<Model>,
    events: I,
    kernel: Option<Arc<KernelLog>>,
    config: &Config,
    mut timing: TimingContext,
) -> Result<Analysis, DriverError>
where
    I: IntoIterator<Item = TraceEvent>,
{
    let settings = &config.analysis;
    let strategy = settings.strategy();
    let strategy_name = strategy.name();

    let mut resolver = FieldResolver::new(config.input.entity_field.as_str());
    let mut group = InstanceGroup::new(Arc::clone(&model))
        .with_strategy(strategy)
        .with_all_instances_valid(settings.all_instances_valid);
    if let Some(log) = kernel {
        let oracle = Arc::clone(&log);
        resolver = resolver.with_oracle(move |cpu, ts| oracle.thread_on_cpu(cpu, ts));
        group = group.with_backend(log);
    }
    let mut group = group.with_resolver(resolver);

    group.build_on(events, &mut timing)?;

    let dropped_verdicts = if settings.clean_up_adaptive {
        group.clean_up_adaptive()?
    } else {
        0
    };

    let segments = {
        let mut scope = timing.scope("segments");
        let store = group.extract_segments(&VariableIntervalProducer)?;
        scope.set_items(store.len() as u64);
        store.into_vec()
    };

    let adaptive = group
        .adaptive()
        .iter()
        .map(|slot| AdaptiveSummary {
            constraint: slot.constraint().to_string(),
            samples: slot.sample_count(),
            decision: slot
                .decision()
                .map(|decision| slot.constraint().label(Some(decision))),
        })
        .collect();

    let invalid_instances = group
        .instances()
        .iter()
        .filter(|i| i.status() == StatusValue::Invalid)
        .count();
    let valid_instances = group
        .instances()
        .iter()
        .filter(|i| i.status() == StatusValue::Valid)
        .count();

    let instances = if config.output.dump_instances {
        group.instances().iter().map(InstanceReport::from).collect()
    } else {
        Vec::new()
    };

    let analysis = Analysis {
        model: model.name().to_string(),
        checksum: model.checksum().to_string(),
        strategy: strategy_name,
        stats: group.stats(),
        valid_instances,
        invalid_instances,
        adaptive,
        dropped_verdicts,
        segments,
        instances,
        timings: timing.measurements().to_vec(),
    };

    info!(
        model = %analysis.model,
        instances = group.instances().len(),
        invalid = analysis.invalid_instances,
        segments = analysis.segments.len(),
        elapsed_us = timing.total().as_micros() as u64,
        "analysis complete"
    );
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyKind;
    use smtrace_core::{EntityId, KernelRecord};
    use smtrace_core::backend::ThreadRun;
    use std::io::Write;

    const MODEL: &str = r#"{
        "name": "io",
        "nodes": [
            {"name": "busy", "variables": [{"name": "deadline/t"}, {"name": "cputime/t"}]},
            {"name": "done"}
        ],
        "initial": [{"event": "enter", "to": "busy"}],
        "transitions": [
            {"from": "busy", "event": "exit", "to": "done", "guards": ["deadline/t < 100 && cputime/t < ?"]}
        ]
    }"#;

    fn ev(name: &str, ts: u64, tid: i64) -> TraceEvent {
        TraceEvent::new(name, ts).with_field("context._vtid", tid)
    }

    #[test]
    fn test_analyze_in_memory() {
        let model = Arc::new(Model::from_json_str(MODEL).unwrap());
        let events = vec![
            ev("enter", 0, 1),
            ev("enter", 10, 2),
            ev("noise", 20, 1),
            ev("exit", 50, 2),
            ev("exit", 500, 1),
        ];
        let mut config = Config::default();
        config.output.dump_instances = true;

        let analysis = analyze(model, events, None, &config, TimingContext::new()).unwrap();

        assert_eq!(analysis.stats.received, 5);
        assert_eq!(analysis.stats.filtered, 1);
        assert_eq!(analysis.invalid_instances, 1);
        assert_eq!(analysis.instances.len(), 2);

        // no kernel data, so the cputime constraint has no samples and is dropped
        assert_eq!(analysis.adaptive.len(), 1);
        assert_eq!(analysis.adaptive[0].decision, None);
        assert_eq!(analysis.dropped_verdicts, 2);

        let invalid: Vec<_> = analysis.invalid_segments().collect();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].entity, Some(EntityId(1)));
        assert_eq!((invalid[0].start, invalid[0].end), (0, 500));

        let phases: Vec<&str> = analysis.timings.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(phases, vec!["receive", "finalize", "segments"]);
    }

    #[test]
    fn test_kernel_log_resolves_entities() {
        let model = Arc::new(Model::from_json_str(MODEL).unwrap());
        let log = KernelLog::from_records([
            KernelRecord::Run(ThreadRun {
                cpu: 0,
                entity: EntityId(4),
                start: 0,
                end: 1000,
            }),
        ]);
        // events carry no thread id, only the cpu
        let events = vec![
            TraceEvent::new("enter", 0).with_cpu(0),
            TraceEvent::new("exit", 40).with_cpu(0),
        ];
        let mut config = Config::default();
        config.analysis.strategy = StrategyKind::Percentile;
        config.output.dump_instances = true;

        let analysis =
            analyze(model, events, Some(Arc::new(log)), &config, TimingContext::new()).unwrap();
        assert_eq!(analysis.strategy, "percentile");
        assert_eq!(analysis.instances[0].entity, Some(EntityId(4)));
        assert_eq!(analysis.adaptive[0].samples, 1);
        assert_eq!(analysis.adaptive[0].decision.as_deref(), Some("cputime/t < 41"));
        assert_eq!(analysis.invalid_instances, 0);
    }

    #[test]
    fn test_run_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.json");
        std::fs::write(&model_path, MODEL).unwrap();

        let events_path = dir.path().join("trace.jsonl");
        let mut file = std::fs::File::create(&events_path).unwrap();
        for (name, ts) in [("enter", 0), ("exit", 300), ("enter", 400), ("exit", 450)] {
            writeln!(
                file,
                r#"{{"name": "{}", "timestamp": {}, "fields": {{"context._vtid": 9}}}}"#,
                name, ts
            )
            .unwrap();
        }
        drop(file);

        let mut config = Config::default();
        config.input.model = Some(model_path);
        config.input.events = Some(events_path);
        config.input.end = Some(350);

        let analysis = run(&config).unwrap();
        assert_eq!(analysis.stats.received, 2);
        assert_eq!(analysis.invalid_instances, 1);
        assert_eq!(analysis.timings[0].name, "load");
        assert_eq!(analysis.timings[0].items, Some(2));

        let segments_path = dir.path().join("segments.json");
        analysis.write_segments(&segments_path).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&segments_path).unwrap()).unwrap();
        assert_eq!(written[0]["invalid_constraints"][0], "deadline/t < 100");
    }

    #[test]
    fn test_run_requires_model() {
        assert!(matches!(
            run(&Config::default()),
            Err(DriverError::MissingInput("model"))
        ));
    }
}
