//! Process entry point: bootstraps configuration, logging, storage, and
//! spawns the worker pool for every stage (§5, §6). Exit codes follow §6:
//! `0` clean shutdown, `1` unrecoverable configuration error, `2` bus
//! disconnect beyond reconnect budget, `3` fatal handler panic.

use std::process::ExitCode;
use std::sync::Arc;

use recruit_pipeline::config::{Settings, DEFAULT_HANDLER_DEADLINE_SECONDS, DEFAULT_RESUME_PARSER_CONCURRENCY};
use recruit_pipeline::db;
use recruit_pipeline::llm;
use recruit_pipeline::logging;
use recruit_pipeline::pipeline::bus::{Bus, SqliteBus};
use recruit_pipeline::pipeline::jd_extractor::JdExtractor;
use recruit_pipeline::pipeline::object_store::{ObjectStore, SqliteObjectStore};
use recruit_pipeline::pipeline::report_generator::ReportGenerator;
use recruit_pipeline::pipeline::resume_parser::ResumeParser;
use recruit_pipeline::pipeline::scoring_engine::ScoringEngine;
use recruit_pipeline::pipeline::session_coordinator::SessionCoordinator;
use recruit_pipeline::pipeline::subjects::{
    dlq_subject, ANALYSIS_JD_EXTRACTED, ANALYSIS_MATCH_SCORED, ANALYSIS_REPORT_GENERATED, ANALYSIS_RESUME_PARSED,
    GROUP_JD_EXTRACTORS, GROUP_REPORT_GENERATORS, GROUP_RESUME_PARSERS, GROUP_SCORING_ENGINES,
    GROUP_SESSION_COORDINATOR, JOB_JD_SUBMITTED, JOB_RESUME_SUBMITTED,
};
use recruit_pipeline::pipeline::worker::WorkerPool;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    logging::setup_panic_hook(&settings.data_dir);
    logging::init_logging(&settings.data_dir);
    log::info!("starting recruit-pipeline, data_dir={}", settings.data_dir.display());

    let conn = match db::get_connection(&settings.data_dir).and_then(|conn| {
        db::init_database(&conn)?;
        Ok(conn)
    }) {
        Ok(conn) => Arc::new(tokio::sync::Mutex::new(conn)),
        Err(e) => {
            log::error!("failed to initialize database: {}", e);
            return ExitCode::from(1);
        }
    };

    if settings.bus_url.is_none() && !settings.bus_optional {
        log::error!("BUS_URL is required unless BUS_OPTIONAL=true");
        return ExitCode::from(1);
    }

    let bus: Arc<dyn Bus> = Arc::new(SqliteBus::new(conn.clone()));
    let object_store: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::new(conn.clone()));
    let llm_adapter = llm::resolve(&settings);

    let pool = Arc::new(WorkerPool::new(
        bus.clone(),
        settings.ack_wait,
        settings.max_deliveries,
        std::time::Duration::from_secs(DEFAULT_HANDLER_DEADLINE_SECONDS),
    ));

    let jd_extractor = Arc::new(JdExtractor::new(conn.clone(), bus.clone(), llm_adapter.clone()));
    let resume_parser = Arc::new(ResumeParser::new(conn.clone(), bus.clone(), object_store.clone(), llm_adapter.clone()));
    let scoring_engine = Arc::new(ScoringEngine::new(conn.clone(), bus.clone(), settings.pairing_ttl));
    let report_generator = Arc::new(ReportGenerator::new(conn.clone(), bus.clone(), llm_adapter.clone()));
    let session_coordinator = Arc::new(SessionCoordinator::new(conn.clone()));

    let mut handles = Vec::new();
    handles.extend(pool.clone().spawn(JOB_JD_SUBMITTED, GROUP_JD_EXTRACTORS, settings.worker_concurrency, jd_extractor.clone()));
    handles.extend(pool.clone().spawn(
        JOB_RESUME_SUBMITTED,
        GROUP_RESUME_PARSERS,
        DEFAULT_RESUME_PARSER_CONCURRENCY,
        resume_parser.clone(),
    ));
    handles.extend(pool.clone().spawn(ANALYSIS_JD_EXTRACTED, GROUP_SCORING_ENGINES, settings.worker_concurrency, scoring_engine.clone()));
    handles.extend(pool.clone().spawn(ANALYSIS_RESUME_PARSED, GROUP_SCORING_ENGINES, settings.worker_concurrency, scoring_engine.clone()));
    handles.extend(pool.clone().spawn(ANALYSIS_MATCH_SCORED, GROUP_REPORT_GENERATORS, settings.worker_concurrency, report_generator.clone()));

    for subject in [
        JOB_JD_SUBMITTED,
        JOB_RESUME_SUBMITTED,
        ANALYSIS_JD_EXTRACTED,
        ANALYSIS_RESUME_PARSED,
        ANALYSIS_MATCH_SCORED,
        ANALYSIS_REPORT_GENERATED,
    ] {
        let coordinator = session_coordinator.clone();
        handles.extend(pool.clone().spawn(subject, GROUP_SESSION_COORDINATOR, 1, coordinator.clone()));
        let dlq = Box::leak(dlq_subject(subject).into_boxed_str());
        handles.extend(pool.clone().spawn(dlq, GROUP_SESSION_COORDINATOR, 1, coordinator));
    }

    let scoring_for_sweep = scoring_engine.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match scoring_for_sweep.sweep_stale_pending().await {
                Ok(0) => {}
                Ok(n) => log::info!("swept {} stale pairing-cache entries to DLQ", n),
                Err(e) => log::error!("pairing-cache sweep failed: {}", e),
            }
        }
    });
    handles.push(sweep_handle);

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutdown signal received, stopping workers");
    for handle in handles {
        handle.abort();
    }
    ExitCode::from(0)
}
