use clap::{Arg, Command};
use ebc_fetch::attachments::ImageConverter;
use ebc_fetch::claim_time::RallyWindow;
use ebc_fetch::config::{database_root, Config, ConfigSource};
use ebc_fetch::fetcher::ShutdownSignal;
use ebc_fetch::mailbox::{ImapConnector, MailboxConnector, SearchCriteria};
use ebc_fetch::responder::{DiagnosticResponder, SmtpResponder};
use ebc_fetch::{run_cycle, Ingestor, ParseMode, ScoreStore, SubjectParser};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("ebc-fetch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Electronic bonus claim fetcher for rally scoring")
        .long_about("Polls the rally claims mailbox, checks each bonus claim against the\n\
                    score database, stores the photos and records the claim for the\n\
                    scorers. In test mode every claim is answered with a diagnostic reply\n\
                    instead of being recorded.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("cfg")
                .value_name("FILE")
                .help("YAML configuration file (default: settings stored in the database)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("PATH")
                .help("Score database")
                .default_value("sm/ScoreMaster.db"),
        )
        .arg(
            Arg::new("trap")
                .long("trap")
                .value_name("DIR")
                .help("Save every fetched message to this directory")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("init-db")
                .long("init-db")
                .help("Create any missing tables in the score database")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-subject")
                .long("test-subject")
                .value_name("TEXT")
                .help("Parse a claim subject with the configured patterns and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single fetch cycle and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("silent")
                .short('s')
                .long("silent")
                .help("Only log warnings and errors")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else if matches.get_flag("silent") {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };

    // The builder passes debug records; the global ceiling decides, so the
    // `verbose` setting can move it up and down at each refresh.
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Debug)
        .init();
    log::set_max_level(log_level);

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let db_path = PathBuf::from(
        matches
            .get_one::<String>("db")
            .map(String::as_str)
            .unwrap_or("sm/ScoreMaster.db"),
    );
    let store = match ScoreStore::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening score database {}: {e}", db_path.display());
            process::exit(1);
        }
    };
    if matches.get_flag("init-db") {
        if let Err(e) = store.ensure_schema() {
            eprintln!("Error initialising score database: {e}");
            process::exit(1);
        }
        log::info!("Score database schema checked: {}", db_path.display());
    }

    let source = match matches.get_one::<String>("config") {
        Some(path) => ConfigSource::File(PathBuf::from(path)),
        None => ConfigSource::Database,
    };
    let trap = matches.get_one::<String>("trap").cloned();

    let (config, window) = match load_settings(&source, &store, trap.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration from {}: {e}", source.describe());
            process::exit(1);
        }
    };

    if let Some(subject) = matches.get_one::<String>("test-subject") {
        test_subject(&config, &window, subject);
        return;
    }

    if config.dont_run {
        log::warn!("Configuration says DontRun; exiting");
        return;
    }

    let image_root = database_root(&db_path);
    prepare_images(&config, &image_root);

    let mut ingestor = match Ingestor::new(
        config.clone(),
        window,
        store,
        &image_root,
        responder_for(&config),
    ) {
        Ok(ingestor) => ingestor,
        Err(e) => {
            eprintln!("Error building claim pipeline: {e}");
            process::exit(1);
        }
    };

    log::info!(
        "ebc-fetch v{} starting: rally '{}' ({}), settings from {}",
        env!("CARGO_PKG_VERSION"),
        ingestor.window().title,
        ingestor.window().tz.name(),
        source.describe()
    );
    announce(None, ingestor.config(), log_level);

    let shutdown = Arc::new(ShutdownSignal::new());
    shutdown.listen_for_ctrl_c();

    let once = matches.get_flag("once");
    loop {
        let config = ingestor.config();
        if config.monitoring_enabled() {
            match criteria_for(config) {
                Ok(criteria) => {
                    let (host, port) = config.imap_endpoint();
                    let connector: Arc<dyn MailboxConnector> = Arc::new(ImapConnector::new(
                        &host,
                        port,
                        &config.login,
                        &config.password,
                    ));
                    let report = run_cycle(connector, &ingestor, criteria).await;
                    if report.seen > 0 || report.stream_error.is_some() {
                        log::info!(
                            "Cycle: {} requested, {} seen, {} accepted, {} dealt with, {} released",
                            report.requested,
                            report.seen,
                            report.accepted.len(),
                            report.dealt_with.len(),
                            report.skipped.len()
                        );
                    }
                    if let Some(e) = &report.ack_error {
                        log::error!("Acknowledgement failed: {e}");
                    }
                }
                Err(e) => log::error!("Bad NotBefore/NotAfter settings: {e}"),
            }
        }

        if once || shutdown.is_requested() {
            break;
        }

        let pause = Duration::from_secs(ingestor.config().sleep_seconds.max(1));
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.wait() => break,
        }

        match load_settings(&source, ingestor.store(), trap.as_deref()) {
            Ok((config, window)) => {
                let previous = ingestor.config().clone();
                if config.dont_run {
                    log::warn!("Configuration now says DontRun; exiting");
                    break;
                }
                if config.convert_heic != previous.convert_heic
                    || config.image_folder != previous.image_folder
                {
                    prepare_images(&config, &image_root);
                }
                let responder = responder_for(&config);
                match ingestor.reconfigure(config, window, responder) {
                    Ok(()) => announce(Some(&previous), ingestor.config(), log_level),
                    Err(e) => log::warn!("Keeping previous settings: {e}"),
                }
            }
            Err(e) => log::warn!("Keeping previous settings, reload failed: {e}"),
        }
    }
}

fn load_settings(
    source: &ConfigSource,
    store: &ScoreStore,
    trap: Option<&str>,
) -> anyhow::Result<(Config, RallyWindow)> {
    let mut config = source.load(store)?;
    if let Some(dir) = trap {
        config.trap_mails = true;
        config.trap_path = dir.to_string();
    }
    let params = store.rally_params()?;
    let window = RallyWindow::new(&params.title, &params.start, &params.finish, &params.timezone)?;
    Ok((config, window))
}

fn responder_for(config: &Config) -> Box<dyn DiagnosticResponder> {
    Box::new(SmtpResponder::new(config.smtp.clone().unwrap_or_default()))
}

fn criteria_for(config: &Config) -> anyhow::Result<SearchCriteria> {
    let (sent_since, sent_before) = config.sent_bounds()?;
    Ok(SearchCriteria {
        without_flags: config.select_flags.clone(),
        sent_since,
        sent_before,
    })
}

fn prepare_images(config: &Config, image_root: &Path) {
    let dir = image_root.join(&config.image_folder);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("Cannot create image folder {}: {e}", dir.display());
    }
    if config.convert_heic {
        let converter = ImageConverter::new(&config.heic_converter);
        if !converter.probe() {
            log::warn!(
                "Image converter '{}' cannot be run; non-JPEG photos will fail",
                converter.program()
            );
        }
    }
}

fn announce(previous: Option<&Config>, config: &Config, base_level: LevelFilter) {
    log::set_max_level(config.log_level(base_level));
    if previous.map(|p| p.verbose) != Some(config.verbose) && config.verbose {
        log::debug!("Verbose logging enabled by configuration");
    }
    let monitoring = config.monitoring_enabled();
    if previous.map(Config::monitoring_enabled) != Some(monitoring) {
        if monitoring {
            log::info!("Monitoring {} as {}", config.imap_server, config.login);
        } else {
            log::info!("Monitoring is off (no server or login configured)");
        }
    }
    if previous.map(|p| p.test_mode) != Some(config.test_mode) {
        if config.test_mode {
            log::info!("TEST MODE: claims are answered, not recorded");
        } else {
            log::info!("Live mode: claims are recorded");
        }
    }
}

fn test_subject(config: &Config, window: &RallyWindow, subject: &str) {
    let parser = match SubjectParser::new(&config.subject_pattern, &config.strict_pattern, window.tz)
    {
        Ok(parser) => parser,
        Err(e) => {
            eprintln!("Error compiling subject patterns: {e}");
            process::exit(1);
        }
    };
    println!("Subject: '{subject}'");
    for (label, mode) in [("Lenient", ParseMode::Lenient), ("Strict", ParseMode::Strict)] {
        let claim = parser.parse(subject, mode);
        println!("{label}: {claim:#?}");
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
