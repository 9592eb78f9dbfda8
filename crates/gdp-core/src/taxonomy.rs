//! Program keyword taxonomy shared by every pipeline entry point.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BUILTIN_VERSION: &str = "builtin-2026.1";

const BUILTIN_TAGS: &[(&str, &[&str])] = &[
    (
        "disaster-relief",
        &[
            "disaster",
            "emergency",
            "recovery",
            "resilience",
            "hurricane",
            "flood",
            "wildfire",
            "hazard mitigation",
            "fema",
        ],
    ),
    (
        "rural-health",
        &[
            "rural",
            "telehealth",
            "telemedicine",
            "critical access",
            "frontier",
            "community health",
        ],
    ),
    (
        "arts-culture",
        &[
            "art",
            "culture",
            "creative",
            "music",
            "audio",
            "museum",
            "humanities",
            "performing",
        ],
    ),
    (
        "education",
        &[
            "education",
            "student",
            "school",
            "stem",
            "curriculum",
            "literacy",
            "teacher",
        ],
    ),
    (
        "workforce-development",
        &[
            "workforce",
            "job training",
            "apprenticeship",
            "employment",
            "career",
            "reentry",
        ],
    ),
    (
        "veterans",
        &[
            "veteran",
            "military",
            "service member",
            "armed forces",
            "gold star",
        ],
    ),
    (
        "small-business",
        &[
            "small business",
            "entrepreneur",
            "startup",
            "sbir",
            "sttr",
            "minority-owned",
            "women-owned",
        ],
    ),
    (
        "technology-innovation",
        &[
            "artificial intelligence",
            "machine learning",
            "innovation",
            "broadband",
            "digital",
            "cybersecurity",
            "software",
        ],
    ),
    (
        "accessibility",
        &[
            "accessibility",
            "disability",
            "assistive technology",
            "deaf",
            "blind",
            "caption",
        ],
    ),
    (
        "community-development",
        &[
            "community development",
            "nonprofit",
            "housing",
            "neighborhood",
            "economic development",
            "underserved",
        ],
    ),
    (
        "mental-health",
        &[
            "mental health",
            "behavioral health",
            "suicide prevention",
            "substance use",
            "trauma",
            "wellness",
        ],
    ),
];

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("reading taxonomy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("taxonomy defines no tags")]
    Empty,
    #[error("taxonomy tag {0} is defined more than once")]
    DuplicateTag(String),
    #[error("taxonomy tag {0} has no keywords")]
    EmptyTag(String),
    #[error("taxonomy tag {tag}: keyword {keyword:?} is contained in {container:?}")]
    OverlappingKeywords {
        tag: String,
        keyword: String,
        container: String,
    },
    #[error("unknown taxonomy tags: {}", .0.join(", "))]
    UnknownTags(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyTag {
    pub tag: String,
    pub keywords: Vec<String>,
}

/// Version-stamped mapping of program tag to ordered lowercase keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Taxonomy {
    version: String,
    tags: Vec<TaxonomyTag>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    version: String,
    #[serde(default)]
    tags: Vec<TaxonomyTag>,
}

impl Taxonomy {
    pub fn builtin() -> Self {
        let tags = BUILTIN_TAGS
            .iter()
            .map(|(tag, keywords)| TaxonomyTag {
                tag: (*tag).to_string(),
                keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
            })
            .collect();
        Self {
            version: BUILTIN_VERSION.to_string(),
            tags,
        }
    }

    /// Builds a taxonomy, lowercasing and trimming keywords and dropping blanks.
    pub fn new(version: impl Into<String>, tags: Vec<TaxonomyTag>) -> Result<Self, TaxonomyError> {
        if tags.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(tags.len());
        for tag in tags {
            let name = tag.tag.trim().to_ascii_lowercase();
            if !seen.insert(name.clone()) {
                return Err(TaxonomyError::DuplicateTag(name));
            }
            let mut keywords: Vec<String> = Vec::with_capacity(tag.keywords.len());
            for keyword in tag.keywords {
                let keyword = keyword.trim().to_lowercase();
                if !keyword.is_empty() && !keywords.contains(&keyword) {
                    keywords.push(keyword);
                }
            }
            if keywords.is_empty() {
                return Err(TaxonomyError::EmptyTag(name));
            }
            // One word would otherwise count as several distinct hits.
            if let Some((keyword, container)) = overlapping_keywords(&keywords) {
                return Err(TaxonomyError::OverlappingKeywords {
                    tag: name,
                    keyword: keyword.to_string(),
                    container: container.to_string(),
                });
            }
            normalized.push(TaxonomyTag { tag: name, keywords });
        }
        Ok(Self {
            version: version.into(),
            tags: normalized,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(yaml)?;
        Self::new(file.version, file.tags)
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tags(&self) -> &[TaxonomyTag] {
        &self.tags
    }

    pub fn keywords_for(&self, tag: &str) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|t| t.tag == tag)
            .map(|t| t.keywords.as_slice())
    }

    /// Maps a caller's requested tags onto taxonomy entries. An empty request
    /// selects every tag.
    pub fn resolve_targets(&self, requested: &[String]) -> Result<Vec<&TaxonomyTag>, TaxonomyError> {
        let requested: Vec<String> = requested
            .iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if requested.is_empty() {
            return Ok(self.tags.iter().collect());
        }

        let unknown: Vec<String> = requested
            .iter()
            .filter(|t| self.keywords_for(t).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(TaxonomyError::UnknownTags(unknown));
        }

        Ok(self
            .tags
            .iter()
            .filter(|t| requested.contains(&t.tag))
            .collect())
    }

    /// Flattened keyword list, in taxonomy order and without repeats, used to
    /// build outbound adapter queries.
    pub fn query_keywords(targets: &[&TaxonomyTag]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut keywords = Vec::new();
        for tag in targets {
            for keyword in &tag.keywords {
                if seen.insert(keyword.clone()) {
                    keywords.push(keyword.clone());
                }
            }
        }
        keywords
    }
}

/// First keyword that is a substring of another keyword in the same list.
fn overlapping_keywords(keywords: &[String]) -> Option<(&str, &str)> {
    keywords.iter().find_map(|keyword| {
        keywords
            .iter()
            .find(|other| *other != keyword && other.contains(keyword.as_str()))
            .map(|container| (keyword.as_str(), container.as_str()))
    })
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}
