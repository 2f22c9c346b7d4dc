use sha2::{Digest, Sha256};

pub fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Short, filesystem-safe id derived from a user id.
pub fn user_key(user_id: &str) -> String {
    compute_hash(&format!("user:{user_id}"))[..32].to_string()
}
