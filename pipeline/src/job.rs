use serde::{Deserialize, Serialize};

/// Tissue classes the segmenter can produce masks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tissue {
    Body,
    Bone,
    Muscle,
}

impl std::str::FromStr for Tissue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "body" => Ok(Tissue::Body),
            "bone" => Ok(Tissue::Bone),
            "muscle" => Ok(Tissue::Muscle),
            other => Err(format!("unknown tissue: {other}")),
        }
    }
}

impl std::fmt::Display for Tissue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Tissue::Body => write!(f, "body"),
            Tissue::Bone => write!(f, "bone"),
            Tissue::Muscle => write!(f, "muscle"),
        }
    }
}

/// One reconstruction job as handed over by the queue runtime: input blob
/// keys, an output prefix, and the tissue list to segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub input_keys: Vec<String>,
    pub output_prefix: String,
    #[serde(default = "default_tissues")]
    pub tissues: Vec<Tissue>,
}

fn default_tissues() -> Vec<Tissue> {
    vec![Tissue::Bone]
}

/// Job lifecycle as recorded by the metadata store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed { stl_key: String, glb_key: String },
    Failed { kind: String, message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tissue_parses_case_insensitively() {
        assert_eq!("Bone".parse::<Tissue>().unwrap(), Tissue::Bone);
        assert_eq!(" muscle ".parse::<Tissue>().unwrap(), Tissue::Muscle);
        assert!("fat".parse::<Tissue>().is_err());
    }

    #[test]
    fn request_defaults_to_bone() {
        let r: JobRequest = serde_json::from_str(
            r#"{"id":"j1","input_keys":["a.dcm"],"output_prefix":"mesh/j1"}"#,
        )
        .unwrap();
        assert_eq!(r.tissues, vec![Tissue::Bone]);
    }

    #[test]
    fn status_serializes_with_tag() {
        let s = JobStatus::Failed {
            kind: "invalid_input".into(),
            message: "no readable slices".into(),
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains(r#""state":"failed""#));
        assert!(s.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
