//! Per-opcode executors. [`dispatch`] is the single entry point; the opcode
//! set is closed, so the match is exhaustive.

mod artifacts;
mod download;
mod envvars;
mod exec;
mod filesystem;
mod report;

use std::path::{Path, PathBuf};

use crate::instruction::{Instruction, Opcode};
use crate::session::{BuildSession, StepResult};

pub(crate) fn dispatch(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    match node.opcode {
        Opcode::Compose => compose(session, node, wd),
        Opcode::Exec => exec::exec(session, node, wd),
        Opcode::Echo => envvars::echo(session, node),
        Opcode::Export => envvars::export(session, node, wd),
        Opcode::Secret => envvars::secret(session, node),
        Opcode::Fail => envvars::fail(session, node),
        Opcode::Test => filesystem::test(session, node, wd),
        Opcode::Mkdirs => filesystem::mkdirs(session, node, wd),
        Opcode::Cleandir => filesystem::cleandir(session, node, wd),
        Opcode::UploadArtifact => artifacts::upload_artifact(session, node, wd),
        Opcode::GenerateTestReport => artifacts::generate_test_report(session, node, wd),
        Opcode::GenerateProperty => artifacts::generate_property(session, node, wd),
        Opcode::DownloadFile => download::download_file(session, node, wd),
        Opcode::DownloadDir => download::download_dir(session, node, wd),
        Opcode::ReportCurrentStatus => report::report_current_status(session, node),
        Opcode::ReportCompleting => report::report_completing(session),
        Opcode::ReportCompleted => report::report_completed(session),
        Opcode::End => report::end(session),
        Opcode::Noop => Ok(true),
    }
}

/// Resolves an argument path against the node's working directory.
pub(crate) fn resolve_path(wd: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        wd.join(path)
    }
}

/// Runs every child in order and ANDs their outcomes. A failing child does
/// not stop the later ones; their run conditions see the failing state and
/// decide for themselves.
fn compose(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let mut all_passed = true;
    for child in &node.sub_commands {
        if !session.process(child, wd)? {
            all_passed = false;
        }
    }
    Ok(all_passed)
}
