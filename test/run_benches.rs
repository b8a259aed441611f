use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tempfile::Builder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting writer_bench run with --read-after-write...");

    let temp_dir = Builder::new().prefix("fmq_bench").tempdir()?;
    let config_file_path: PathBuf = temp_dir.path().join("bench_config.toml");
    let queue_path = temp_dir.path().join("bench_queue");

    // Few slots and a small buffer so the run wraps both.
    let config_content = format!(
        "[fmq]\n\
        path = \"{}\"\n\
        nslots = 7\n\
        buf_size = 1024\n\
        mode = \"create\"\n\
        compression = \"zlib\"\n",
        queue_path.to_string_lossy().replace('\\', "\\\\"),
    );
    let mut file = File::create(&config_file_path)?;
    file.write_all(config_content.as_bytes())?;
    println!("Temporary benchmark config created at: {}", config_file_path.display());

    let cargo_executable = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let writer_output = Command::new(&cargo_executable)
        .arg("run")
        .arg("--release")
        .arg("--package")
        .arg("writer_bench")
        .arg("--")
        .arg("--config")
        .arg(&config_file_path)
        .arg("--count")
        .arg("50")
        .arg("--size")
        .arg("60")
        .arg("--read-after-write")
        .output()?;

    println!("writer_bench stdout:\n{}", String::from_utf8_lossy(&writer_output.stdout));
    println!("writer_bench stderr:\n{}", String::from_utf8_lossy(&writer_output.stderr));

    if !writer_output.status.success() {
        eprintln!("writer_bench failed with status: {}", writer_output.status);
        return Err(Box::new(std::io::Error::new(std::io::ErrorKind::Other, "writer_bench failed")));
    }
    println!("\nwriter_bench run finished.");
    Ok(())
}
