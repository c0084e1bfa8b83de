//! CLI command implementations.

use anyhow::{Context, Result};
use serde::Serialize;
use smartfetch_git::{FetchOptions, FetchResult, Fetcher, HttpTransport, NegotiationConfig};
use smartfetch_storage::FsRepository;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Arguments of `smartfetch fetch`.
#[derive(Debug, Clone, Default)]
pub struct FetchCommand {
    pub url: String,
    pub git_dir: PathBuf,
    pub refspecs: Vec<String>,
    pub depth: Option<u32>,
    pub unshallow: bool,
    pub max_rounds: Option<usize>,
    pub initial_window: Option<usize>,
    pub quiet: bool,
    pub json: bool,
}

impl FetchCommand {
    /// Builds library options from the command line.
    pub fn options(&self) -> FetchOptions {
        let mut negotiation = NegotiationConfig::default();
        if let Some(max_rounds) = self.max_rounds {
            negotiation.max_rounds = max_rounds;
        }
        if let Some(initial_window) = self.initial_window {
            negotiation.initial_window = initial_window;
            negotiation.max_window = negotiation.max_window.max(initial_window);
        }

        let mut options = FetchOptions::new()
            .with_unshallow(self.unshallow)
            .with_negotiation(negotiation);
        options.refspecs = self.refspecs.clone();
        options.depth = self.depth;
        if !self.quiet {
            options = options.with_progress(|text| {
                let mut stderr = std::io::stderr().lock();
                let _ = stderr.write_all(text.as_bytes());
                let _ = stderr.flush();
            });
        }
        options
    }
}

/// Initialize an empty repository.
pub async fn init(path: &Path) -> Result<()> {
    tracing::info!(path = %path.display(), "Initializing repository");
    let repo = FsRepository::init(path)
        .await
        .with_context(|| format!("failed to initialize {}", path.display()))?;
    println!(
        "Initialized empty repository in {}",
        repo.git_dir().display()
    );
    Ok(())
}

/// List remote refs.
pub async fn ls_remote(url: &str, json: bool) -> Result<()> {
    tracing::info!(url = %url, "Listing remote refs");
    let transport = HttpTransport::new()?;
    let advertisement = smartfetch_git::ls_remote(&transport, url)
        .await
        .with_context(|| format!("failed to list refs of {url}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&advertisement.refs)?);
    } else {
        for r in &advertisement.refs {
            println!("{}\t{}", r.id, r.name);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct FetchReport<'a> {
    url: &'a str,
    refs: &'a [FetchResult],
}

/// Fetch from a remote.
pub async fn fetch(command: FetchCommand) -> Result<()> {
    let repo = FsRepository::open(&command.git_dir)
        .await
        .with_context(|| format!("failed to open {}", command.git_dir.display()))?;
    let fetcher = Fetcher::new(repo, HttpTransport::new()?);

    let results = fetcher
        .fetch(&command.url, &command.options())
        .await
        .with_context(|| format!("failed to fetch {}", command.url))?;
    tracing::info!(
        url = %command.url,
        git_dir = %fetcher.repo().git_dir().display(),
        refs = results.len(),
        "Fetched"
    );

    if command.json {
        let report = FetchReport {
            url: &command.url,
            refs: &results,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !command.quiet {
        println!("From {}", command.url);
    }
    for result in &results {
        if let Some(line) = describe(result) {
            println!("{line}");
        }
    }
    Ok(())
}

/// One summary line per changed ref, `None` if it did not move.
fn describe(result: &FetchResult) -> Option<String> {
    let line = match result.from {
        None => format!(" * [new ref]   {} -> {}", short(&result.to.to_hex()), result.ref_name),
        Some(from) if from != result.to => format!(
            "   {}..{}  {}",
            short(&from.to_hex()),
            short(&result.to.to_hex()),
            result.ref_name
        ),
        Some(_) => return None,
    };
    Some(line)
}

fn short(hex: &str) -> &str {
    &hex[..hex.len().min(7)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartfetch_storage::ObjectId;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn test_options_from_command() {
        let command = FetchCommand {
            refspecs: vec!["refs/heads/main:refs/remotes/origin/main".to_string()],
            depth: Some(3),
            max_rounds: Some(2),
            initial_window: Some(512),
            quiet: true,
            ..Default::default()
        };
        let options = command.options();
        assert_eq!(options.refspecs, command.refspecs);
        assert_eq!(options.depth, Some(3));
        assert!(options.progress.is_none());
        assert_eq!(options.negotiation.max_rounds, 2);
        assert_eq!(options.negotiation.initial_window, 512);
        assert_eq!(options.negotiation.max_window, 512);
    }

    #[test]
    fn test_progress_unless_quiet() {
        let options = FetchCommand::default().options();
        assert!(options.progress.is_some());
        assert_eq!(options.negotiation, NegotiationConfig::default());
    }

    #[test]
    fn test_describe() {
        let created = FetchResult {
            ref_name: "refs/remotes/origin/main".to_string(),
            from: None,
            to: id(0xab),
        };
        assert_eq!(
            describe(&created).unwrap(),
            " * [new ref]   abababa -> refs/remotes/origin/main"
        );

        let moved = FetchResult {
            from: Some(id(0x01)),
            ..created.clone()
        };
        assert_eq!(
            describe(&moved).unwrap(),
            "   0101010..abababa  refs/remotes/origin/main"
        );

        let same = FetchResult {
            from: Some(id(0xab)),
            ..created
        };
        assert!(describe(&same).is_none());
    }

    #[tokio::test]
    async fn test_init_creates_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.git");
        init(&path).await.unwrap();
        assert!(path.join("objects").is_dir());
        assert!(path.join("HEAD").is_file());
        FsRepository::open(&path).await.unwrap();
    }
}
