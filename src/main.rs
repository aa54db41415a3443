use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    changeguard::logging::init();
    Ok(changeguard::run()?)
}
