//! recall-cli: command-line client for the Recall session memory daemon
//!
//! Talks to `recall-server` over its HTTP API.
//!
//! # Subcommands
//! - `save --agent <name> [--file <path>]`   capture a conversation (stdin by default)
//! - `search <query> [-n <limit>] [--json]`  ranked semantic search
//! - `query <query>`                          alias for search
//! - `context --agent <name>`                 context block for a new session
//! - `list`, `get <id>`, `delete <id>`        session management
//! - `status`                                 server health

mod capture;

use std::io::Read;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8767";
const DEFAULT_LIMIT: usize = 5;
const DEFAULT_CONTEXT_SESSIONS: usize = 3;
const DEFAULT_CONTEXT_RELEVANCE: f32 = 0.3;
const DEFAULT_PROJECT: &str = "default";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "recall-cli", version, about = "Recall session memory CLI")]
struct Cli {
    /// Recall HTTP server URL (overrides RECALL_HTTP_URL env var)
    #[arg(long, env = "RECALL_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Only sessions by this agent
    #[arg(long)]
    agent: Option<String>,

    /// Only sessions from this workflow
    #[arg(long)]
    workflow: Option<String>,

    /// Only sessions from this project
    #[arg(long)]
    project: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Query text to search for
    query: String,

    /// Maximum number of results to return
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
    limit: usize,

    /// Drop results below this relevance
    #[arg(long)]
    min_relevance: Option<f32>,

    #[command(flatten)]
    filter: FilterArgs,

    /// Print the raw JSON response
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture a finished conversation as a session
    Save {
        /// Agent identifier, e.g. "architect"
        #[arg(long)]
        agent: String,

        /// Display persona; defaults to the title-cased agent name
        #[arg(long)]
        persona: Option<String>,

        #[arg(long, default_value = DEFAULT_PROJECT)]
        project: String,

        #[arg(long)]
        workflow: Option<String>,

        /// Comma-separated topics; extracted from the text when omitted
        #[arg(long)]
        topics: Option<String>,

        /// Comma-separated artifact paths
        #[arg(long)]
        artifacts: Option<String>,

        /// RFC 3339 start time; estimated from the conversation when omitted
        #[arg(long)]
        start_time: Option<DateTime<Utc>>,

        /// RFC 3339 end time; defaults to now
        #[arg(long)]
        end_time: Option<DateTime<Utc>>,

        /// Conversation file; stdin when omitted or "-"
        #[arg(long)]
        file: Option<String>,
    },

    /// Search past sessions semantically
    Search(SearchArgs),

    /// Alias for search
    Query(SearchArgs),

    /// Print a context block of relevant past sessions
    Context {
        /// Current agent
        #[arg(long)]
        agent: String,

        /// Current workflow
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        project: Option<String>,

        /// Query text; derived from workflow or agent when omitted
        #[arg(long)]
        query: Option<String>,

        #[arg(long, default_value_t = DEFAULT_CONTEXT_SESSIONS)]
        max_sessions: usize,

        #[arg(long, default_value_t = DEFAULT_CONTEXT_RELEVANCE)]
        min_relevance: f32,

        /// Excerpt length per session, in characters
        #[arg(long)]
        max_chars: Option<usize>,
    },

    /// List stored sessions
    List {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(short = 'n', long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show one session
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete one session
    Delete { id: String },

    /// Show Recall server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionMeta {
    pub agent_name: String,
    pub agent_persona: String,
    pub workflow: String,
    pub project_name: String,
    pub start_time: String,
    pub message_count: u32,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResult {
    pub session_id: String,
    pub document: String,
    pub metadata: SessionMeta,
    pub relevance_score: f64,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub count: usize,
    pub took_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub metadata: SessionMeta,
}

/// One-line header plus a short preview, as printed by `search`.
pub fn render_result(r: &SearchResult, preview_chars: usize) -> String {
    let preview: String = r.document.chars().take(preview_chars).collect();
    let topics = if r.metadata.topics.is_empty() {
        String::new()
    } else {
        format!("  Topics: {}", r.metadata.topics.join(", "))
    };
    format!(
        "{} [{} / {} / {}]\nRelevance: {:.0}%{}\n\n{}\n",
        r.session_id,
        r.metadata.agent_persona,
        r.metadata.workflow,
        r.metadata.project_name,
        r.relevance_score * 100.0,
        topics,
        preview
    )
}

pub fn render_summary(s: &SessionSummary) -> String {
    let date = s.metadata.start_time.get(..10).unwrap_or(&s.metadata.start_time);
    format!(
        "{}  {}  {} ({})  {}  {} msgs",
        s.session_id,
        date,
        s.metadata.agent_persona,
        s.metadata.agent_name,
        s.metadata.workflow,
        s.metadata.message_count
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a request and return the JSON body, or fail with the server's error.
fn send(req: reqwest::blocking::RequestBuilder, url: &str) -> anyhow::Result<serde_json::Value> {
    let resp = req
        .send()
        .with_context(|| format!("connection failed to {}", url))?;
    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("no error message");
        bail!("server returned {}: {}", status, message);
    }
    resp.json().context("failed to parse server response")
}

fn read_conversation(file: Option<&str>) -> anyhow::Result<String> {
    match file {
        Some(path) if path != "-" => {
            std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))
        }
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn do_save(
    server: &str,
    agent: String,
    persona: Option<String>,
    project: String,
    workflow: Option<String>,
    topics: Option<String>,
    artifacts: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    file: Option<String>,
) -> anyhow::Result<()> {
    let document = capture::preprocess(&read_conversation(file.as_deref())?);
    if document.is_empty() {
        bail!("conversation is empty after preprocessing, nothing saved");
    }

    let topics = match topics.as_deref().map(capture::split_list) {
        Some(t) if !t.is_empty() => t,
        _ => capture::extract_topics(&document, capture::MAX_TOPICS),
    };
    let end = end_time.unwrap_or_else(Utc::now);
    let start = start_time
        .unwrap_or_else(|| end - Duration::minutes(capture::estimate_session_minutes(&document)));

    let mut body = serde_json::json!({
        "document": document,
        "agent_persona": persona.unwrap_or_else(|| capture::title_case(&agent)),
        "agent_name": agent,
        "project_name": project,
        "topics": topics,
        "artifacts_created": artifacts.as_deref().map(capture::split_list).unwrap_or_default(),
        "start_time": start.to_rfc3339(),
        "end_time": end.to_rfc3339(),
    });
    if let Some(w) = workflow {
        body["workflow"] = serde_json::json!(w);
    }

    let url = format!("{}/sessions", server);
    let data = send(client(30)?.post(&url).json(&body), &url)?;
    println!("{}", data["session_id"].as_str().unwrap_or("?"));
    Ok(())
}

fn filter_json(filter: &FilterArgs) -> serde_json::Value {
    serde_json::json!({
        "agent_name": filter.agent,
        "workflow": filter.workflow,
        "project_name": filter.project,
    })
}

fn do_search(server: &str, args: SearchArgs) -> anyhow::Result<()> {
    let mut body = filter_json(&args.filter);
    body["query"] = serde_json::json!(args.query);
    body["max_results"] = serde_json::json!(args.limit);
    if let Some(t) = args.min_relevance {
        body["min_relevance"] = serde_json::json!(t);
    }

    let url = format!("{}/search", server);
    let data = send(client(30)?.post(&url).json(&body), &url)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let resp: SearchResponse =
        serde_json::from_value(data).context("failed to parse search response")?;
    if resp.results.is_empty() {
        eprintln!("No sessions found for: {}", resp.query);
        return Ok(());
    }
    for r in &resp.results {
        println!("{}", render_result(r, 200));
    }
    eprintln!(
        "{} sessions in {}ms",
        resp.count,
        resp.took_ms.unwrap_or_default()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn do_context(
    server: &str,
    agent: String,
    workflow: Option<String>,
    project: Option<String>,
    query: Option<String>,
    max_sessions: usize,
    min_relevance: f32,
    max_chars: Option<usize>,
) -> anyhow::Result<()> {
    let query = query.unwrap_or_else(|| capture::default_context_query(&agent, workflow.as_deref()));
    let body = serde_json::json!({
        "query": query,
        "agent_name": agent,
        "workflow": workflow,
        "project_name": project,
        "max_sessions": max_sessions,
        "min_relevance": min_relevance,
        "max_chars": max_chars,
    });

    let url = format!("{}/context", server);
    let data = send(client(30)?.post(&url).json(&body), &url)?;
    // Nothing relevant prints nothing
    if let Some(context) = data["context"].as_str().filter(|c| !c.is_empty()) {
        println!("{}", context);
    }
    Ok(())
}

fn do_list(
    server: &str,
    filter: FilterArgs,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let url = format!("{}/sessions", server);
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(a) = filter.agent {
        params.push(("agent_name", a));
    }
    if let Some(w) = filter.workflow {
        params.push(("workflow", w));
    }
    if let Some(p) = filter.project {
        params.push(("project_name", p));
    }
    if let Some(n) = limit {
        params.push(("limit", n.to_string()));
    }

    let data = send(client(30)?.get(&url).query(&params), &url)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let sessions: Vec<SessionSummary> = serde_json::from_value(data["sessions"].clone())
        .context("failed to parse session list")?;
    if sessions.is_empty() {
        eprintln!("No sessions stored");
    }
    for s in &sessions {
        println!("{}", render_summary(s));
    }
    Ok(())
}

/// `<server>/sessions/<id>` with the id encoded as a single path segment.
fn session_url(server: &str, id: &str) -> anyhow::Result<reqwest::Url> {
    let mut url =
        reqwest::Url::parse(server).with_context(|| format!("Invalid server URL {server}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Server URL {server} cannot carry a path"))?
        .pop_if_empty()
        .extend(["sessions", id]);
    Ok(url)
}

fn do_get(server: &str, id: &str, json: bool) -> anyhow::Result<()> {
    let url = session_url(server, id)?;
    let data = send(client(30)?.get(url.clone()), url.as_str())?;
    let session = &data["session"];

    if json {
        println!("{}", serde_json::to_string_pretty(session)?);
        return Ok(());
    }

    let meta = &session["metadata"];
    println!("Session:  {}", session["id"].as_str().unwrap_or(id));
    println!(
        "Agent:    {} ({})",
        meta["agent_persona"].as_str().unwrap_or("?"),
        meta["agent_name"].as_str().unwrap_or("?")
    );
    println!("Workflow: {}", meta["workflow"].as_str().unwrap_or("?"));
    println!("Project:  {}", meta["project_name"].as_str().unwrap_or("?"));
    println!(
        "Time:     {} .. {}",
        meta["start_time"].as_str().unwrap_or("?"),
        meta["end_time"].as_str().unwrap_or("?")
    );
    println!("\n{}", session["document"].as_str().unwrap_or(""));
    Ok(())
}

fn do_delete(server: &str, id: &str) -> anyhow::Result<()> {
    let url = session_url(server, id)?;
    let data = send(client(30)?.delete(url.clone()), url.as_str())?;
    if data["deleted"].as_bool().unwrap_or(false) {
        println!("Deleted {}", id);
    } else {
        println!("No session {}", id);
    }
    Ok(())
}

fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Recall server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:         {}", body["store"].as_str().unwrap_or("?"));
            println!("Collection:    {}", body["collection"].as_str().unwrap_or("?"));
            println!("Sessions:      {}", body["sessions"].as_u64().unwrap_or(0));
            println!(
                "Embedding:     {} ({} dims)",
                body["embedding"].as_str().unwrap_or("?"),
                body["dimensions"].as_u64().unwrap_or(0)
            );
            println!("Socket:        {}", body["socket"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("recall-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("recall-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Save {
            agent,
            persona,
            project,
            workflow,
            topics,
            artifacts,
            start_time,
            end_time,
            file,
        } => do_save(
            &server, agent, persona, project, workflow, topics, artifacts, start_time, end_time,
            file,
        ),
        Commands::Search(args) | Commands::Query(args) => do_search(&server, args),
        Commands::Context {
            agent,
            workflow,
            project,
            query,
            max_sessions,
            min_relevance,
            max_chars,
        } => do_context(
            &server,
            agent,
            workflow,
            project,
            query,
            max_sessions,
            min_relevance,
            max_chars,
        ),
        Commands::List {
            filter,
            limit,
            json,
        } => do_list(&server, filter, limit, json),
        Commands::Get { id, json } => do_get(&server, &id, json),
        Commands::Delete { id } => do_delete(&server, &id),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("recall-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        SessionMeta {
            agent_name: "architect".to_string(),
            agent_persona: "Winston".to_string(),
            workflow: "create-architecture".to_string(),
            project_name: "MyProject".to_string(),
            start_time: "2025-01-15T14:00:00.000000Z".to_string(),
            message_count: 3,
            topics: vec!["caching".to_string()],
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_save_with_defaults() {
        let cli = Cli::try_parse_from(["recall-cli", "save", "--agent", "pm"]).unwrap();
        assert_eq!(cli.server, DEFAULT_SERVER);
        match cli.command {
            Commands::Save {
                agent,
                persona,
                project,
                end_time,
                ..
            } => {
                assert_eq!(agent, "pm");
                assert!(persona.is_none());
                assert_eq!(project, "default");
                assert!(end_time.is_none());
            }
            other => panic!("Expected Save, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_save_times() {
        let cli = Cli::try_parse_from([
            "recall-cli",
            "save",
            "--agent",
            "pm",
            "--end-time",
            "2025-01-15T14:30:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Save { end_time, .. } => {
                assert_eq!(end_time.unwrap().to_rfc3339(), "2025-01-15T14:30:00+00:00");
            }
            other => panic!("Expected Save, got {other:?}"),
        }
        assert!(Cli::try_parse_from([
            "recall-cli", "save", "--agent", "pm", "--end-time", "yesterday"
        ])
        .is_err());
    }

    #[test]
    fn test_parse_query_alias_and_filters() {
        let cli = Cli::try_parse_from([
            "recall-cli",
            "query",
            "caching strategies",
            "-n",
            "3",
            "--agent",
            "architect",
        ])
        .unwrap();
        match cli.command {
            Commands::Query(args) => {
                assert_eq!(args.query, "caching strategies");
                assert_eq!(args.limit, 3);
                assert_eq!(args.filter.agent.as_deref(), Some("architect"));
                assert!(args.filter.workflow.is_none());
            }
            other => panic!("Expected Query, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_context_defaults() {
        let cli = Cli::try_parse_from(["recall-cli", "context", "--agent", "architect"]).unwrap();
        match cli.command {
            Commands::Context {
                max_sessions,
                min_relevance,
                query,
                ..
            } => {
                assert_eq!(max_sessions, 3);
                assert!((min_relevance - 0.3).abs() < f32::EPSILON);
                assert!(query.is_none());
            }
            other => panic!("Expected Context, got {other:?}"),
        }
    }

    #[test]
    fn test_render_result() {
        let r = SearchResult {
            session_id: "2025-01-15-architect-a1b2c3".to_string(),
            document: "User: caching?\nAssistant: Redis.".to_string(),
            metadata: meta(),
            relevance_score: 0.8165,
        };
        let out = render_result(&r, 14);
        assert!(out.starts_with("2025-01-15-architect-a1b2c3 [Winston / create-architecture / MyProject]"));
        assert!(out.contains("Relevance: 82%  Topics: caching\n"));
        assert!(out.ends_with("User: caching?\n"));
    }

    #[test]
    fn test_render_summary() {
        let s = SessionSummary {
            session_id: "2025-01-15-architect-a1b2c3".to_string(),
            metadata: meta(),
        };
        assert_eq!(
            render_summary(&s),
            "2025-01-15-architect-a1b2c3  2025-01-15  Winston (architect)  create-architecture  3 msgs"
        );
    }

    #[test]
    fn test_search_response_parses_server_shape() {
        let json = serde_json::json!({
            "query": "caching",
            "count": 1,
            "took_ms": 4,
            "results": [{
                "session_id": "2025-01-15-architect-a1b2c3",
                "document": "User: caching?",
                "distance": 0.2,
                "relevance_score": 0.8,
                "metadata": {
                    "agent_name": "architect",
                    "agent_persona": "Winston",
                    "workflow": "none",
                    "project_name": "MyProject",
                    "start_time": "2025-01-15T14:00:00.000000Z",
                    "end_time": "2025-01-15T14:30:00.000000Z",
                    "message_count": 1,
                    "topics": [],
                    "artifacts_created": [],
                    "session_status": "completed"
                }
            }]
        });
        let resp: SearchResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(resp.results[0].metadata.agent_persona, "Winston");
    }

    #[test]
    fn test_session_url_encodes_id_as_one_segment() {
        let url = session_url("http://127.0.0.1:8765", "2025-01-15-architect-abc123").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8765/sessions/2025-01-15-architect-abc123");

        let url = session_url("http://127.0.0.1:8765/", "qa/lead?x#y").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8765/sessions/qa%2Flead%3Fx%23y");

        assert!(session_url("not a url", "id").is_err());
    }
}
