use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::EnvironmentConfig;
use crate::parameters::{self, filter_parameters, StackParameter};
use crate::stack::{self, DeployOutcome, Deployer, StackDescriptor, StackService};
use crate::template::{self, TemplateStore};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Parameters(#[from] parameters::Error),

    #[error(transparent)]
    Template(#[from] template::Error),

    #[error(transparent)]
    Stack(#[from] stack::Error),
}

impl Error {
    fn is_cancellation(&self) -> bool {
        matches!(self, Error::Stack(stack::Error::Cancelled(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    S3DataBucket,
    ElasticSearch,
}

impl ResourceKind {
    /// Deployment order within one block iteration.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::S3DataBucket, ResourceKind::ElasticSearch];

    pub fn stack_prefix(&self) -> &'static str {
        match self {
            ResourceKind::S3DataBucket => "kf-artemis-s3-bucket-data",
            ResourceKind::ElasticSearch => "kf-artemis-elasticsearch",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::S3DataBucket => "s3 bucket",
            ResourceKind::ElasticSearch => "elastic search",
        }
    }

    /// Parameters read from the environment block.
    fn global_parameters(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::S3DataBucket => {
                &["ProjectId", "NamingSuffix", "BlockPrefix", "OpsBucketName"]
            }
            ResourceKind::ElasticSearch => &["NamingSuffix"],
        }
    }

    /// Parameters read from the resource's own block.
    fn resource_parameters(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::S3DataBucket => &[
                "SFTPEnabled",
                "SFTPUserRoleId",
                "DataAthenaQuerying",
                "BucketSecurity",
                "BucketVersioning",
                "DataRetentionRequirement",
            ],
            ResourceKind::ElasticSearch => {
                &["InstanceType", "ElasticSearchVersion", "KMSEncryptionKey"]
            }
        }
    }

    pub fn instance_count(&self, config: &EnvironmentConfig) -> Option<i64> {
        match self {
            ResourceKind::S3DataBucket => config.s3_data_bucket.instance_count,
            ResourceKind::ElasticSearch => config.elastic_search.instance_count,
        }
    }

    pub fn template_key<'a>(&self, config: &'a EnvironmentConfig) -> &'a str {
        match self {
            ResourceKind::S3DataBucket => &config.s3_data_bucket.template_key,
            ResourceKind::ElasticSearch => &config.elastic_search.template_key,
        }
    }

    pub fn parameters(
        &self,
        environment: &str,
        config: &EnvironmentConfig,
        block: Option<u32>,
    ) -> Result<Vec<StackParameter>, parameters::Error> {
        let mut filtered = filter_parameters(self.global_parameters(), config)?;
        let names = self.resource_parameters();
        let resource = match self {
            ResourceKind::S3DataBucket => filter_parameters(names, &config.s3_data_bucket)?,
            ResourceKind::ElasticSearch => filter_parameters(names, &config.elastic_search)?,
        };
        filtered.extend(resource);
        filtered.push(StackParameter::new("Environment", environment));
        if let Some(block) = block {
            filtered.push(StackParameter::new("BlockIteration", block.to_string()));
        }

        return Ok(filtered);
    }
}

/// `kf-artemis-<resource>-<environment>-<namingSuffix>[-<blockIteration>]`
pub fn stack_name(
    kind: ResourceKind,
    environment: &str,
    naming_suffix: &str,
    block: Option<u32>,
) -> String {
    let name = format!("{}-{}-{}", kind.stack_prefix(), environment, naming_suffix);
    match block {
        Some(block) => format!("{}-{}", name, block),
        None => name,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePolicy {
    Deploy,
    Unsupported(i64),
    Skip,
}

impl InstancePolicy {
    pub fn from_count(count: Option<i64>) -> Self {
        match count {
            Some(1) => InstancePolicy::Deploy,
            Some(count) if count > 1 => InstancePolicy::Unsupported(count),
            _ => InstancePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Overrides `BlockInstanceCount`.
    pub block_count: Option<u32>,
    /// Continue with the remaining resources after a failed deployment.
    pub keep_going: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryResult {
    Deployed { outcome: DeployOutcome },
    Skipped,
    Unsupported { instance_count: i64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEntry {
    pub resource: ResourceKind,
    pub block: Option<u32>,
    pub stack_name: String,
    #[serde(flatten)]
    pub result: EntryResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub environment: String,
    pub entries: Vec<RunEntry>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.result, EntryResult::Failed { .. }))
    }
}

/// Deploys every resource kind of one environment, one stack at a time.
pub struct Orchestrator<'a, S: ?Sized, T: ?Sized> {
    deployer: Deployer<'a, S>,
    templates: &'a T,
    options: Options,
}

impl<'a, S, T> Orchestrator<'a, S, T>
where
    S: StackService + ?Sized,
    T: TemplateStore + ?Sized,
{
    pub fn new(deployer: Deployer<'a, S>, templates: &'a T, options: Options) -> Self {
        Self {
            deployer,
            templates,
            options,
        }
    }

    fn blocks(&self, config: &EnvironmentConfig) -> Vec<Option<u32>> {
        match self.options.block_count.or(config.block_instance_count) {
            Some(count) => (1..=count).map(Some).collect(),
            None => vec![None],
        }
    }

    pub async fn run(&self, environment: &str, config: &EnvironmentConfig) -> RunSummary {
        let mut summary = RunSummary {
            environment: environment.to_string(),
            ..Default::default()
        };

        for block in self.blocks(config) {
            for kind in ResourceKind::ALL {
                if self.deployer.is_cancelled() {
                    warn!("Cancelled, not deploying the remaining stacks");
                    summary.cancelled = true;
                    return summary;
                }

                let name = stack_name(kind, environment, &config.naming_suffix, block);
                let policy = InstancePolicy::from_count(kind.instance_count(config));
                let result = match policy {
                    InstancePolicy::Deploy => {
                        match self.deploy(kind, environment, config, block).await {
                            Ok(outcome) => EntryResult::Deployed { outcome },
                            Err(err) => {
                                error!("Deploying {} failed: {}", name, err);
                                summary.cancelled =
                                    err.is_cancellation() || self.deployer.is_cancelled();
                                EntryResult::Failed {
                                    error: err.to_string(),
                                }
                            }
                        }
                    }
                    InstancePolicy::Unsupported(count) => {
                        warn!(
                            "Creating more than one {} stack instance is not currently supported \
                             ({} requested)",
                            kind.label(),
                            count
                        );
                        EntryResult::Unsupported { instance_count: count }
                    }
                    InstancePolicy::Skip => {
                        info!("Skipping {} stack instance creation.", kind.label());
                        EntryResult::Skipped
                    }
                };

                let failed = matches!(result, EntryResult::Failed { .. });
                summary.entries.push(RunEntry {
                    resource: kind,
                    block,
                    stack_name: name,
                    result,
                });

                if summary.cancelled || (failed && !self.options.keep_going) {
                    return summary;
                }
            }
        }

        // A cancellation that lands after the last deploy still marks the run.
        summary.cancelled = self.deployer.is_cancelled();
        return summary;
    }

    /// Filters parameters, fetches and validates the template, then creates or updates the stack.
    pub async fn deploy(
        &self,
        kind: ResourceKind,
        environment: &str,
        config: &EnvironmentConfig,
        block: Option<u32>,
    ) -> Result<DeployOutcome, Error> {
        let parameters = kind.parameters(environment, config, block)?;
        let name = stack_name(kind, environment, &config.naming_suffix, block);

        let template = self
            .templates
            .fetch(&config.ops_bucket_name, kind.template_key(config))
            .await?;
        let template_body = template::parse(template, self.deployer.service()).await?;

        let descriptor = StackDescriptor::new(name, template_body, parameters);
        return Ok(self.deployer.deploy(&descriptor).await?);
    }
}
