pub mod context;
pub mod deploy;
pub mod init;
pub mod serve;
pub mod status;

use cutover_core::ErrorKind;
use cutover_deploy::DeployError;

/// Exit code for an error that stopped a command before it produced a
/// report. Unrecognised errors (config, I/O, a state file that stayed
/// busy) exit 1.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DeployError>() {
        Some(e) => e.exit_code(),
        None => ErrorKind::Internal.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_state::StateError;

    #[test]
    fn deploy_errors_keep_their_codes() {
        let err = anyhow::Error::new(DeployError::NoRollbackTarget("prod".to_string()));
        assert_eq!(exit_code(&err), 16);

        let err = anyhow::Error::new(DeployError::DeploymentInProgress("prod".to_string()));
        assert_eq!(exit_code(&err), 15);
    }

    #[test]
    fn busy_state_file_is_not_a_deployment_conflict() {
        let err = anyhow::Error::new(StateError::Locked(".cutover/state.redb".to_string()));
        assert_eq!(exit_code(&err), 1);

        let err = anyhow::Error::new(DeployError::State(StateError::Locked("x".to_string())));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn other_errors_exit_one() {
        let err = anyhow::anyhow!("reading cutover.toml");
        assert_eq!(exit_code(&err), 1);

        let err = anyhow::Error::new(StateError::Open("disk full".to_string()));
        assert_eq!(exit_code(&err), 1);
    }
}
