use std::{
    env,
    fs::{self, File},
    io::{ErrorKind, Write as _},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::{ResultMapErrExt as _, is_superuser};

/// Copies the running executable to `target_dir/name` and writes a unit file built from
/// `unit_template`, replacing `{binary}` with the installed path.
///
/// Re-running it overwrites both, after stopping a possibly running previous install.
pub fn install_self_as_service(
    name: &str,
    unit_template: &str,
    target_dir: &Path,
) -> Result<PathBuf, String> {
    if !is_superuser() {
        return Err("You must run this command as root or with sudo.".to_string());
    }

    let binary_path = env::current_exe().map_err_to_string("Failed to locate own binary")?;
    let target_bin = target_dir.join(name);
    let service_name = format!("{name}.service");

    // Stop potentially existing service it before overwriting
    drop(
        Command::new("systemctl")
            .arg("stop")
            .arg(&service_name)
            .stderr(Stdio::null())
            .status(),
    );

    if binary_path != target_bin {
        fs::copy(&binary_path, &target_bin).map_err_to_string("Failed to copy binary")?;
        fs::set_permissions(&target_bin, fs::Permissions::from_mode(0o755))
            .map_err_to_string("Failed to mark binary executable")?;
    }
    println!("Installed binary to {target_bin:?}");

    let service_file_path = unit_path(&service_name);
    let service_file_content = unit_template.replace("{binary}", &target_bin.to_string_lossy());

    let mut service_file =
        File::create(&service_file_path).map_err_to_string("Failed to create unit file")?;
    service_file
        .write_all(service_file_content.as_bytes())
        .map_err_to_string("Failed to write unit file")?;
    println!("Created systemd service file at {service_file_path:?}");

    drop(service_file);

    run_checked(Command::new("systemctl").arg("daemon-reload"), "systemctl daemon-reload")?;

    Ok(target_bin)
}

/// Enables the unit so it starts on boot and starts it right away.
pub fn start_and_enable_self_as_service(name: &str) -> Result<(), String> {
    let service_name = format!("{name}.service");

    run_checked(
        Command::new("systemctl")
            .arg("enable")
            .arg("--now")
            .arg(&service_name),
        "systemctl enable",
    )?;

    println!("Service {service_name} started and enabled.");
    Ok(())
}

/// Disables and removes the unit and the installed binary. Missing pieces are skipped.
pub fn uninstall_self_as_service(name: &str, target_dir: &Path) -> Result<(), String> {
    if !is_superuser() {
        return Err("You must run this command as root or with sudo.".to_string());
    }

    let service_name = format!("{name}.service");
    drop(
        Command::new("systemctl")
            .arg("disable")
            .arg("--now")
            .arg(&service_name)
            .stderr(Stdio::null())
            .status(),
    );

    for path in [unit_path(&service_name), target_dir.join(name)] {
        match fs::remove_file(&path) {
            Ok(()) => println!("Removed {path:?}"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(format!("Failed to remove {path:?}: {e}")),
        }
    }

    run_checked(Command::new("systemctl").arg("daemon-reload"), "systemctl daemon-reload")?;

    Ok(())
}

fn unit_path(service_name: &str) -> PathBuf {
    PathBuf::from("/etc/systemd/system").join(service_name)
}

/// Runs `command` to completion; a non-zero exit is an error carrying its stderr.
fn run_checked(command: &mut Command, what: &str) -> Result<(), String> {
    let output = command.output().map_err_to_string(what)?;
    if output.status.success() {
        return Ok(());
    }
    Err(format!(
        "{what} failed ({}): {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = run_checked(
            Command::new("sh").args(["-c", "echo 'unit not found' >&2; exit 5"]),
            "systemctl enable",
        )
        .unwrap_err();
        assert!(err.starts_with("systemctl enable failed"), "{err}");
        assert!(err.contains("unit not found"), "{err}");
    }

    #[test]
    fn success_and_spawn_failure() {
        assert_eq!(run_checked(&mut Command::new("true"), "true"), Ok(()));
        let err = run_checked(
            &mut Command::new("/nonexistent/systemctl"),
            "systemctl daemon-reload",
        )
        .unwrap_err();
        assert!(err.starts_with("systemctl daemon-reload: "), "{err}");
    }
}
