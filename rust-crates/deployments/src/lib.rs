use anyhow::{
    Context,
    Result,
    anyhow,
};
use chrono::Utc;
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const DEPLOYMENT_FILE: &str = "deployment.json";

/// Networks the ledger program is deployed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum DeploymentEnv {
    Local,
    Kovan,
}

impl DeploymentEnv {
    pub const ALL: [DeploymentEnv; 2] = [DeploymentEnv::Local, DeploymentEnv::Kovan];

    pub fn from_network_id(network_id: u64) -> Option<Self> {
        match network_id {
            1337 => Some(DeploymentEnv::Local),
            42 => Some(DeploymentEnv::Kovan),
            _ => None,
        }
    }

    pub fn network_id(self) -> u64 {
        match self {
            DeploymentEnv::Local => 1337,
            DeploymentEnv::Kovan => 42,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Local => "local",
            DeploymentEnv::Kovan => "kovan",
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Local => "Local",
            DeploymentEnv::Kovan => "Kovan",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployed_at: String,
    pub program_address: String,
    #[serde(default)]
    pub bytecode_hash: Option<String>,
}

impl DeploymentRecord {
    pub fn new(program_address: impl Into<String>) -> Self {
        Self {
            deployed_at: Utc::now().to_rfc3339(),
            program_address: program_address.into(),
            bytecode_hash: None,
        }
    }

    /// Records without a hash predate hashing and are accepted as-is.
    pub fn is_compatible_with_hash(&self, hash: &str) -> bool {
        self.bytecode_hash
            .as_deref()
            .map(|recorded| recorded == hash)
            .unwrap_or(true)
    }
}

#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn open_at(root: impl AsRef<Path>, env: DeploymentEnv) -> Result<Self> {
        let path = ensure_store(root.as_ref(), env)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DeploymentRecord>> {
        read_record(&self.path)
    }

    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        write_record(&self.path, record)
    }
}

pub fn ensure_structure(root: impl AsRef<Path>) -> Result<()> {
    for env in DeploymentEnv::ALL {
        let _ = ensure_store(root.as_ref(), env)?;
    }
    Ok(())
}

/// Loads every recorded program address keyed by network id.
pub fn load_all(root: impl AsRef<Path>) -> Result<BTreeMap<u64, DeploymentRecord>> {
    let mut records = BTreeMap::new();
    for env in DeploymentEnv::ALL {
        let store = DeploymentStore::open_at(root.as_ref(), env)?;
        if let Some(record) = store.load()? {
            records.insert(env.network_id(), record);
        }
    }
    Ok(records)
}

pub fn compute_bytecode_hash(bytecode: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytecode.as_ref());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct ProgramArtifact {
    #[serde(default, rename = "deployedBytecode")]
    deployed_bytecode: Option<String>,
    #[serde(default)]
    networks: BTreeMap<String, ArtifactNetwork>,
}

#[derive(Debug, Deserialize)]
struct ArtifactNetwork {
    address: Option<String>,
}

/// Hash of the deployed bytecode in a compiled-program artifact, if it carries one.
pub fn artifact_bytecode_hash(path: impl AsRef<Path>) -> Result<Option<String>> {
    let artifact = read_artifact(path.as_ref())?;
    Ok(artifact.deployed_bytecode.map(compute_bytecode_hash))
}

/// Writes a deployment record for every supported network listed in the artifact.
/// Networks outside the supported set are skipped.
pub fn import_artifact(
    root: impl AsRef<Path>,
    artifact_path: impl AsRef<Path>,
) -> Result<Vec<(DeploymentEnv, DeploymentRecord)>> {
    let artifact = read_artifact(artifact_path.as_ref())?;
    let bytecode_hash = artifact.deployed_bytecode.as_ref().map(compute_bytecode_hash);

    let mut imported = Vec::new();
    for (raw_id, network) in &artifact.networks {
        let network_id: u64 = raw_id
            .parse()
            .with_context(|| format!("artifact lists a non-numeric network id {raw_id:?}"))?;
        let Some(env) = DeploymentEnv::from_network_id(network_id) else {
            continue;
        };
        let Some(address) = network.address.as_ref() else {
            continue;
        };
        let record = DeploymentRecord {
            bytecode_hash: bytecode_hash.clone(),
            ..DeploymentRecord::new(address.clone())
        };
        DeploymentStore::open_at(root.as_ref(), env)?.save(&record)?;
        imported.push((env, record));
    }
    Ok(imported)
}

fn read_artifact(path: &Path) -> Result<ProgramArtifact> {
    let data = fs::read(path)
        .with_context(|| format!("Failed to read program artifact {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse program artifact {}", path.display()))
}

fn ensure_store(root: &Path, env: DeploymentEnv) -> Result<PathBuf> {
    let env_dir = root.join(env.dir_name());
    if !env_dir.exists() {
        fs::create_dir_all(&env_dir).with_context(|| {
            format!("Failed to create deployments directory {}", env_dir.display())
        })?;
    }

    let file_path = env_dir.join(DEPLOYMENT_FILE);
    if !file_path.exists() {
        fs::write(&file_path, b"").with_context(|| {
            format!(
                "Failed to create deployment record file for {} at {:?}",
                env, file_path
            )
        })?;
    }

    Ok(file_path)
}

fn read_record(path: impl AsRef<Path>) -> Result<Option<DeploymentRecord>> {
    let data = fs::read(path.as_ref()).context("Failed to read deployment record")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    if let Ok(record) = serde_json::from_slice::<DeploymentRecord>(&data) {
        return Ok(Some(record));
    }
    if let Ok(mut records) = serde_json::from_slice::<Vec<DeploymentRecord>>(&data) {
        return Ok(records.pop());
    }
    Err(anyhow!(
        "Failed to parse deployment record JSON; expected a single deployment object"
    ))
}

fn write_record(path: impl AsRef<Path>, record: &DeploymentRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .context("Failed to serialize deployment record")?;
    fs::write(path.as_ref(), json).context("Failed to write deployment record")?;
    Ok(())
}
