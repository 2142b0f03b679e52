use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use clipbatch::config::{api_key, Config};
use clipbatch::error_codes::{find_coded_error, generic_envelope, CodedError, MISSING_INPUT};
use clipbatch::ffmpeg::Tools;
use clipbatch::http::build_client;
use clipbatch::report::BatchReport;
use clipbatch::slides::SlideField;
use clipbatch::transcribe::TranscriptionClient;
use clipbatch::transfer::SharePointClient;
use clipbatch::tts::TtsClient;
use clipbatch::{
    intro, lines, logging, merge, narrate, normalize, presentation, rename, slides, transcribe,
    transfer, tts, unzip,
};

#[derive(Debug, Parser)]
#[command(name = "clipbatch")]
#[command(version = env!("CLIPBATCH_VERSION"))]
#[command(about = "Batch tooling for manifest-driven video production folders")]
struct Cli {
    /// Config file (default: ./clipbatch.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print results and errors as JSON on stdout
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify and concatenate the clips listed in every global_props.json
    Merge {
        root: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Prepend global_props.mp4 to output.mp4 with a cross fade
    Prepend { root: PathBuf },
    /// Render intro slides from manifest title, subtitle and chapters
    Intro {
        root: PathBuf,
        /// Write the final frame to this PNG (relative to each folder) instead of video
        #[arg(long)]
        still: Option<PathBuf>,
    },
    /// Voice the current manifest transcript onto global_props.mp4
    Narrate {
        root: PathBuf,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Transcribe audio files through the speech-to-text API
    Transcribe { root: PathBuf },
    /// Record clip durations in their sidecar JSON
    Durations { root: PathBuf },
    /// Synthesize every *_transcript.txt to mp3
    Speak {
        root: PathBuf,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Synthesize one mp3 per slide of a slides JSON file
    SpeakSlides {
        slides: PathBuf,
        #[arg(long, value_enum, default_value_t = SlideField::Translation)]
        field: SlideField,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Resample clip audio to 48 kHz mono in place
    NormalizeAudio { dir: PathBuf },
    /// Rename *_NNNN_D.MP4 camera clips to NNNN.MP4
    RenameClips { root: PathBuf },
    /// Rename clips from a "Recorded Name,Actual Name" CSV
    RenameCsv { csv: PathBuf, folder: PathBuf },
    /// Extract every zip archive into a folder named after it
    Unzip { dir: PathBuf },
    /// Download a SharePoint folder
    Fetch {
        /// Server-relative folder, e.g. /sites/team/Shared Documents/raw
        folder: String,
        dest: PathBuf,
        #[arg(long)]
        site: Option<String>,
        #[arg(long, default_value = "mp4")]
        ext: String,
    },
    /// PUT every file of a folder to a web server
    Upload {
        dir: PathBuf,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        ext: Option<String>,
    },
    /// Slide table helpers
    Slides {
        #[command(subcommand)]
        command: SlidesCommand,
    },
    /// List the .MP4 names mentioned in an HTML page
    ScanMp4 { html: PathBuf },
    /// Line-list helpers
    Lines {
        #[command(subcommand)]
        command: LinesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SlidesCommand {
    /// HTML table -> slides.json
    Extract {
        html: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// slides.json -> output/<name>.txt
    Text { slides: PathBuf },
}

#[derive(Debug, Subcommand)]
enum LinesCommand {
    Sort {
        input: PathBuf,
        output: PathBuf,
    },
    /// Lines of A that are not in B
    Diff {
        a: PathBuf,
        b: PathBuf,
        output: PathBuf,
    },
}

enum Output {
    Report(BatchReport),
    Text {
        text: String,
        json: serde_json::Value,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let json = cli.json;

    match run(cli).await {
        Ok(Output::Report(report)) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(error) => eprintln!("error: failed to serialize report: {error}"),
                }
            } else {
                println!("{report}");
            }
            if report.has_failures() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Ok(Output::Text { text, json: value }) => {
            if json {
                println!("{value}");
            } else {
                println!("{text}");
            }
            ExitCode::SUCCESS
        }
        Err(error) => report_error(&error, json),
    }
}

fn report_error(error: &anyhow::Error, json: bool) -> ExitCode {
    let coded = find_coded_error(error);
    if json {
        let envelope = coded
            .map(CodedError::envelope)
            .unwrap_or_else(|| generic_envelope(error));
        match serde_json::to_string(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }
    if coded.is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

async fn run(cli: Cli) -> Result<Output> {
    let config = Config::load(cli.config.as_deref())?;
    let tools = || Tools::resolve(&config.tools);

    let report = match cli.command {
        Commands::Merge { root, dry_run } => merge::merge_tree(&tools()?, &config, &root, dry_run)?,
        Commands::Prepend { root } => presentation::prepend_tree(&tools()?, &config, &root)?,
        Commands::Intro { root, still } => {
            intro::render_tree(&tools()?, &config, &root, still.as_deref())?
        }
        Commands::Narrate { root, provider } => {
            let client = TtsClient::from_config(&config.tts, provider.as_deref())?;
            narrate::narrate_tree(&tools()?, &config, &client, &root).await?
        }
        Commands::Transcribe { root } => {
            let client = TranscriptionClient::from_config(&config.transcription)?;
            transcribe::transcribe_tree(&tools()?, &config, &client, &root).await?
        }
        Commands::Durations { root } => transcribe::durations_tree(&tools()?, &config, &root)?,
        Commands::Speak { root, provider } => {
            let client = TtsClient::from_config(&config.tts, provider.as_deref())?;
            tts::speak_tree(&client, &config, &root).await?
        }
        Commands::SpeakSlides {
            slides,
            field,
            provider,
        } => {
            require_file(&slides)?;
            let client = TtsClient::from_config(&config.tts, provider.as_deref())?;
            tts::speak_slides(&client, &slides, field).await?
        }
        Commands::NormalizeAudio { dir } => normalize::normalize_dir(&tools()?, &config, &dir)?,
        Commands::RenameClips { root } => rename::rename_clips(&config, &root)?,
        Commands::RenameCsv { csv, folder } => {
            require_file(&csv)?;
            rename::rename_from_csv(&csv, &folder)?
        }
        Commands::Unzip { dir } => unzip::unzip_dir(&config, &dir)?,
        Commands::Fetch {
            folder,
            dest,
            site,
            ext,
        } => {
            let client = SharePointClient::from_config(&config, site.as_deref())?;
            transfer::fetch_folder(&client, &folder, &dest, &ext).await?
        }
        Commands::Upload { dir, url, ext } => {
            let base = url.or_else(|| config.upload.url.clone()).ok_or_else(|| {
                anyhow!(CodedError::usage(
                    MISSING_INPUT,
                    "no upload URL; pass --url or set upload.url",
                ))
            })?;
            let token = config.upload.token_env.as_deref().map(api_key).transpose()?;
            let http = build_client(config.sharepoint.timeout_secs)?;
            transfer::upload_dir(&http, &config, &dir, &base, token.as_deref(), ext.as_deref())
                .await?
        }
        Commands::Slides {
            command: SlidesCommand::Extract { html, output },
        } => {
            require_file(&html)?;
            let output = output.unwrap_or_else(|| html.with_file_name("slides.json"));
            let count = slides::extract(&html, &output)?;
            return Ok(Output::Text {
                text: format!("wrote {count} slides to {}", output.display()),
                json: json!({ "ok": true, "slides": count, "output": output }),
            });
        }
        Commands::Slides {
            command: SlidesCommand::Text { slides },
        } => {
            require_file(&slides)?;
            slides::write_texts(&slides)?
        }
        Commands::ScanMp4 { html } => {
            require_file(&html)?;
            let raw = tokio::fs::read_to_string(&html)
                .await
                .with_context(|| format!("failed to read {}", html.display()))?;
            let names = slides::scan_mp4_names(&raw);
            let mut text = names.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("\nTotal MP4 files found: {}", names.len()));
            return Ok(Output::Text {
                json: json!({ "ok": true, "names": names, "total": names.len() }),
                text,
            });
        }
        Commands::Lines {
            command: LinesCommand::Sort { input, output },
        } => {
            require_file(&input)?;
            let count = lines::sort_file(&input, &output)?;
            return Ok(Output::Text {
                text: format!("sorted {count} lines into {}", output.display()),
                json: json!({ "ok": true, "lines": count, "output": output }),
            });
        }
        Commands::Lines {
            command: LinesCommand::Diff { a, b, output },
        } => {
            require_file(&a)?;
            require_file(&b)?;
            let count = lines::diff_files(&a, &b, &output)?;
            return Ok(Output::Text {
                text: format!("wrote {count} differing lines to {}", output.display()),
                json: json!({ "ok": true, "lines": count, "output": output }),
            });
        }
    };

    Ok(Output::Report(report))
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(anyhow!(CodedError::usage(
        MISSING_INPUT,
        format!("file not found: {}", path.display()),
    )))
}
