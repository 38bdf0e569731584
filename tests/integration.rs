use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ph_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ph");
    path
}

fn write_paper(dir: &Path, doc_id: &str, category: &str, title: &str, abstract_text: &str) {
    let paper = serde_json::json!({
        "doc_id": doc_id,
        "category": category,
        "title": title,
        "authors": ["A. Author"],
        "abstract": abstract_text,
    });
    fs::write(dir.join(format!("{}.json", doc_id)), paper.to_string()).unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let papers_dir = root.join("papers");
    fs::create_dir_all(&papers_dir).unwrap();
    write_paper(
        &papers_dir,
        "2401.00001",
        "cs.CL",
        "Attention Is What You Need",
        "We study transformer attention. Self-attention relates every token to every other token. \
         Multi-head attention runs several attention functions in parallel.",
    );
    write_paper(
        &papers_dir,
        "2401.00002",
        "cs.CL",
        "Retrieval Augmented Generation for Question Answering",
        "Retrieval augmented generation combines a retriever with a generator. \
         Retrieved passages ground the answers of the language model.",
    );
    write_paper(
        &papers_dir,
        "2401.00003",
        "cs.CL",
        "Low Rank Adaptation of Language Models",
        "LoRA freezes pretrained weights and trains low rank update matrices. \
         Adapters reduce the number of trainable parameters.",
    );
    write_paper(
        &papers_dir,
        "2401.00004",
        "cs.CV",
        "Convolutional Image Classifiers",
        "Convolutional networks classify images.",
    );

    let config_content = format!(
        r#"[db]
path = "{root}/data/ph.sqlite"

[storage]
data_dir = "{root}/data"

[chunking]
max_tokens = 64
overlap_tokens = 8

[source]
provider = "directory"
root = "{root}/papers"

[synthesis]
provider = "disabled"

[training]
provider = "disabled"

[inference]
provider = "extractive"

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ph.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ph(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ph_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ph binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn collect_and_index(config_path: &Path) {
    let (stdout, stderr, success) = run_ph(config_path, &["collect", "cs.CL"]);
    assert!(success, "collect failed: stdout={}, stderr={}", stdout, stderr);
    let (stdout, stderr, success) = run_ph(config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ph(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/ph.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ph(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ph(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ph(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_collect_filters_category() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ph(&config_path, &["collect", "cs.CL"]);
    assert!(success, "collect failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Collected 3 new papers"), "stdout={}", stdout);
    assert!(stdout.contains("Attention Is What You Need"));
    assert!(!stdout.contains("Convolutional"));
}

#[test]
fn test_collect_twice_skips_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_ph(&config_path, &["collect", "cs.CL"]);
    let (stdout, _, success) = run_ph(&config_path, &["collect", "cs.CL"]);
    assert!(success);
    assert!(stdout.contains("Collected 0 new papers"), "stdout={}", stdout);
    assert!(stdout.contains("3 already stored"));
}

#[test]
fn test_collect_rejects_zero_papers() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ph(&config_path, &["collect", "cs.CL", "--num-papers", "0"]);
    assert!(!success);
    assert!(stderr.contains("num_papers must be between 1 and 500"));
}

#[test]
fn test_index_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    run_ph(&config_path, &["collect", "cs.CL"]);
    let (stdout, _, success) = run_ph(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("Indexed"), "stdout={}", stdout);
    assert!(stdout.contains("from 3 papers"));

    let (stdout, _, success) = run_ph(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("No new chunks to index"));
    assert!(stdout.contains("chunks indexed: 0"));
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (stdout, stderr, success) =
        run_ph(&config_path, &["search", "adapters low rank", "--mode", "keyword"]);
    assert!(success, "search failed: stderr={}", stderr);
    assert!(
        stdout.starts_with("1. "),
        "expected ranked results, got: {}",
        stdout
    );
    assert!(stdout.contains("Low Rank Adaptation of Language Models"));
}

#[test]
fn test_search_hybrid_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (first, _, _) = run_ph(&config_path, &["search", "attention", "--mode", "hybrid"]);
    let (second, _, _) = run_ph(&config_path, &["search", "attention", "--mode", "hybrid"]);
    assert_eq!(first, second, "hybrid search should be deterministic");
    assert!(first.contains("Attention Is What You Need"));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (stdout, _, success) = run_ph(&config_path, &["search", "", "--mode", "keyword"]);
    assert!(success, "Empty query should not fail");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_before_index_is_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ph(&config_path, &["search", "attention"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_rejects_unknown_mode() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ph(&config_path, &["search", "attention", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_status_reports_counts() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (stdout, _, success) = run_ph(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("papers collected:   3"), "stdout={}", stdout);
    assert!(!stdout.contains("chunks indexed:     0"));
    assert!(stdout.contains("qa pairs generated: 0"));
    assert!(stdout.contains("model trained:      false"));
}

#[test]
fn test_generate_without_provider_is_unavailable() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (_, stderr, success) = run_ph(&config_path, &["generate", "--num-papers", "2"]);
    assert!(!success);
    assert!(stderr.contains("generation service unavailable"), "stderr={}", stderr);
}

#[test]
fn test_finetune_without_dataset_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ph(&config_path, &["finetune", "--epochs", "1"]);
    assert!(!success);
    assert!(stderr.contains("run synthetic data generation first"), "stderr={}", stderr);
}

#[test]
fn test_finetune_rejects_bad_hyperparameters() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ph(&config_path, &["finetune", "--epochs", "0"]);
    assert!(!success);
    assert!(stderr.contains("invalid hyperparameter: epochs = 0"), "stderr={}", stderr);
}

#[test]
fn test_chat_falls_back_to_base_with_sources() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (stdout, stderr, success) = run_ph(&config_path, &["chat", "What does LoRA freeze?"]);
    assert!(success, "chat failed: stderr={}", stderr);
    assert!(stdout.contains("note:"), "stdout={}", stdout);
    assert!(stdout.contains("model: base"));
    assert!(stdout.contains("source: Low Rank Adaptation of Language Models"));
}

#[test]
fn test_chat_without_rag_has_no_sources() {
    let (_tmp, config_path) = setup_test_env();
    collect_and_index(&config_path);

    let (stdout, _, success) = run_ph(
        &config_path,
        &["chat", "What does LoRA freeze?", "--model", "base", "--no-rag"],
    );
    assert!(success);
    assert!(!stdout.contains("source:"));
}

#[test]
fn test_evaluate_without_dataset_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ph(&config_path, &["evaluate", "--limit", "5"]);
    assert!(!success);
    assert!(stderr.contains("run synthetic data generation first"), "stderr={}", stderr);
}
