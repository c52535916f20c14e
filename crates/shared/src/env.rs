use std::path::PathBuf;

/// `.env` discovery: the working directory first, then the workspace root
/// two levels up (crates run from their own directory under `cargo test`).
fn find_env_file(file_name: &str) -> Option<PathBuf> {
    [
        PathBuf::from(file_name),
        PathBuf::from("./../../").join(file_name),
    ]
    .into_iter()
    .find(|candidate| candidate.exists())
}

/// Load `.env` and `.env.secrets` when present. Absence is normal; real
/// deployments configure through the process environment.
pub fn load_optional_env_files() {
    for file_name in [".env", ".env.secrets"] {
        if let Some(path) = find_env_file(file_name) {
            if dotenv::from_filename(&path).is_ok() {
                println!("Loaded environment variables from: {}", path.display());
            }
        }
    }
}
