use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn cuadra(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cuadra").unwrap();
    cmd.env("HOME", home)
        .env_remove("RUST_LOG")
        .env_remove("CUADRA_AI_ENDPOINT")
        .env_remove("CUADRA_AI_MODEL");
    cmd
}

/// Initialized data dir with one checking account.
fn setup() -> (tempfile::TempDir, PathBuf) {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("books");
    cuadra(home.path())
        .args(["init", "--data-dir", data.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized cuadra"));
    cuadra(home.path())
        .args(["accounts", "add", "Checking", "--type", "checking", "--payment-medium"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added account"));
    (home, data)
}

fn write_statement(dir: &Path) -> PathBuf {
    let path = dir.join("enero.csv");
    std::fs::write(
        &path,
        "Fecha,Descripción,Cargo,Abono,Saldo\n\
         05/01/2025,OXXO CENTRO,45.50,,954.50\n\
         06/01/2025,SPEI ENVIADO BANORTE,200.00,,754.50\n\
         15/01/2025,NOMINA EMPRESA SA,,1000.00,1754.50\n",
    )
    .unwrap();
    path
}

#[test]
fn test_status_before_init() {
    let home = tempfile::tempdir().unwrap();
    cuadra(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database not found"));
}

#[test]
fn test_commands_require_init() {
    let home = tempfile::tempdir().unwrap();
    cuadra(home.path())
        .args(["accounts", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cuadra init"));
}

#[test]
fn test_init_creates_data_dir_and_database() {
    let (_home, data) = setup();
    assert!(data.join("cuadra.db").exists());
    assert!(data.join("memory").is_dir());
    assert!(data.join("backups").is_dir());
}

#[test]
fn test_accounts_add_and_list() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["accounts", "add", "Tarjeta Oro", "--type", "credit_card"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ACREEDORA"));
    cuadra(home.path())
        .args(["accounts", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Checking").and(predicate::str::contains("Tarjeta Oro")));
}

#[test]
fn test_duplicate_account_fails() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["accounts", "add", "checking", "--type", "checking"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_categories_add_subcategory_and_list() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["categories", "add", "Agua", "--parent", "Servicios"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Servicios > Agua"));
    cuadra(home.path())
        .args(["categories", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Agua"));
}

#[test]
fn test_rules_add_list_delete() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["rules", "add", "GIMNASIO", "--category", "Salud", "--priority", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added rule 1"));
    cuadra(home.path())
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("GIMNASIO"));
    cuadra(home.path()).args(["rules", "delete", "1"]).assert().success();
    cuadra(home.path())
        .args(["rules", "delete", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No active rule"));
}

#[test]
fn test_rules_reject_bad_match_type() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["rules", "add", "X", "--category", "Salud", "--match-type", "fuzzy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid match type"));
}

#[test]
fn test_import_stages_and_guards_against_reimport() {
    let (home, _data) = setup();
    let file = write_statement(home.path());
    let file = file.to_str().unwrap();

    cuadra(home.path())
        .args(["import", file, "--account", "Checking", "--no-ai", "--no-review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Staged 3 movements"));
    cuadra(home.path())
        .args(["import", file, "--account", "Checking", "--no-ai", "--no-review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already imported"));
    cuadra(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending:       3"));
}

#[test]
fn test_import_into_unknown_account_fails() {
    let (home, _data) = setup();
    let file = write_statement(home.path());
    cuadra(home.path())
        .args(["import", file.to_str().unwrap(), "--account", "Ahorro", "--no-ai"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown account"));
}

#[test]
fn test_import_rejects_unknown_policy() {
    let (home, _data) = setup();
    let file = write_statement(home.path());
    cuadra(home.path())
        .args(["import", file.to_str().unwrap(), "--account", "Checking", "--policy", "maybe"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid duplicate policy"));
}

#[test]
fn test_review_without_terminal_keeps_movements_pending() {
    let (home, _data) = setup();
    let file = write_statement(home.path());
    cuadra(home.path())
        .args(["import", file.to_str().unwrap(), "--account", "Checking", "--no-ai", "--no-review"])
        .assert()
        .success();
    cuadra(home.path())
        .args(["review", "--policy", "skip"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed"));
    cuadra(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transactions:  0"));
}

#[test]
fn test_review_with_nothing_pending() {
    let (home, _data) = setup();
    cuadra(home.path())
        .arg("review")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending movements"));
}

#[test]
fn test_repair_on_empty_ledger() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["repair", "scan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger is balanced"));
    cuadra(home.path())
        .args(["repair", "fix", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to repair"));
}

#[test]
fn test_repair_balance() {
    let (home, _data) = setup();
    cuadra(home.path())
        .args(["repair", "balance", "Checking", "--as-of", "2025-01-31", "--balance", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reconciled"));
    cuadra(home.path())
        .args(["repair", "balance", "Checking", "--as-of", "2025-01-31", "--balance", "-10.00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Discrepancy: $10.00"));
    cuadra(home.path())
        .args(["repair", "balance", "Checking", "--as-of", "31/01/2025", "--balance", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid date"));
}

#[test]
fn test_memory_commands_on_empty_store() {
    let (home, data) = setup();
    cuadra(home.path())
        .args(["memory", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total patterns:        0"));
    cuadra(home.path())
        .args(["memory", "show", "PAGO TELMEX", "--amount", "-389"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No learned patterns match"));
    cuadra(home.path())
        .args(["memory", "backup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pattern memory saved"));
    assert!(data.join("memory").join("backups").is_dir());
}

#[test]
fn test_backup_to_explicit_path() {
    let (home, data) = setup();
    let dest = home.path().join("copy.db");
    cuadra(home.path())
        .args(["backup", "--output", dest.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Backup saved").and(predicate::str::contains("Pattern memory")));
    assert!(dest.exists());
    assert!(data.join("memory").join("backups").is_dir());
}

#[test]
fn test_import_latin1_statement_keeps_every_row() {
    let (home, _data) = setup();
    let path = home.path().join("latin1.csv");
    let mut content = b"Fecha,Descripcion,Cargo,Abono,Saldo\n05/01/2025,OXXO CENTRO,10.00,,\n".to_vec();
    content.extend_from_slice(b"06/01/2025,CAF\xC9 ANDAL,50.00,,\n");
    content.extend_from_slice(b"07/01/2025,FARMACIA,5.00,,\n");
    std::fs::write(&path, content).unwrap();
    cuadra(home.path())
        .args(["import", path.to_str().unwrap(), "--account", "Checking", "--no-ai", "--no-review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Staged 3 movements").and(predicate::str::contains("Latin-1")));
}
