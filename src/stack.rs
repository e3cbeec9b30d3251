use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_cloudformation::error::{
    CreateStackError, DescribeStacksError, ListStacksError, UpdateStackError,
    ValidateTemplateError,
};
use aws_sdk_cloudformation::model::{Capability, Parameter, StackStatus};
use aws_sdk_cloudformation::types::SdkError;
use aws_types::SdkConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::parameters::StackParameter;
use crate::signal::Cancellation;

/// Failure reason CloudFormation gives when an update would not change anything.
pub const NO_UPDATES_MESSAGE: &str = "No updates are to be performed.";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),

    #[error("Stack {stack_name} reached {status} while waiting")]
    WaitFailed { stack_name: String, status: String },

    #[error("Timed out waiting for stack {0}")]
    TimedOut(String),

    #[error("Deployment of stack {0} was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackSummary {
    pub name: String,
    pub status: StackStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackPage {
    pub stacks: Vec<StackSummary>,
    pub next_token: Option<String>,
}

/// Everything a create or update call needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDescriptor {
    pub name: String,
    pub template_body: String,
    pub parameters: Vec<StackParameter>,
    pub capabilities: Vec<Capability>,
}

impl StackDescriptor {
    pub fn new(name: String, template_body: String, parameters: Vec<StackParameter>) -> Self {
        Self {
            name,
            template_body,
            parameters,
            capabilities: vec![Capability::CapabilityNamedIam],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeployOutcome {
    Created { stack_id: String },
    Updated { stack_id: String },
    Unchanged { stack_name: String },
}

/// The CloudFormation calls the deployer relies on.
#[async_trait]
pub trait StackService: Send + Sync {
    async fn list_stacks(
        &self,
        statuses: &[StackStatus],
        next_token: Option<String>,
    ) -> Result<StackPage, Error>;

    async fn validate_template(&self, template_body: &str) -> Result<(), Error>;

    /// Returns the id of the new stack.
    async fn create_stack(&self, stack: &StackDescriptor) -> Result<String, Error>;

    /// Returns the id of the updated stack.
    async fn update_stack(&self, stack: &StackDescriptor) -> Result<String, Error>;

    async fn stack_status(&self, stack_name: &str) -> Result<StackStatus, Error>;
}

pub struct CloudFormation {
    client: aws_sdk_cloudformation::Client,
}

impl CloudFormation {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        let client = aws_sdk_cloudformation::Client::new(sdk_config);
        return Self { client };
    }
}

#[async_trait]
impl StackService for CloudFormation {
    async fn list_stacks(
        &self,
        statuses: &[StackStatus],
        next_token: Option<String>,
    ) -> Result<StackPage, Error> {
        let result = self
            .client
            .list_stacks()
            .set_stack_status_filter(Some(statuses.to_vec()))
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|error| service_error(error, ListStacksError::message))?;

        let stacks = result
            .stack_summaries()
            .unwrap_or_else(|| &[])
            .iter()
            .filter_map(|summary| {
                Some(StackSummary {
                    name: summary.stack_name()?.to_string(),
                    status: summary.stack_status()?.clone(),
                })
            })
            .collect();

        return Ok(StackPage {
            stacks,
            next_token: result.next_token().map(str::to_string),
        });
    }

    async fn validate_template(&self, template_body: &str) -> Result<(), Error> {
        self.client
            .validate_template()
            .template_body(template_body)
            .send()
            .await
            .map_err(|error| service_error(error, ValidateTemplateError::message))?;

        return Ok(());
    }

    async fn create_stack(&self, stack: &StackDescriptor) -> Result<String, Error> {
        let result = self
            .client
            .create_stack()
            .stack_name(&stack.name)
            .template_body(&stack.template_body)
            .set_parameters(Some(sdk_parameters(&stack.parameters)))
            .set_capabilities(Some(stack.capabilities.clone()))
            .send()
            .await
            .map_err(|error| service_error(error, CreateStackError::message))?;

        return result
            .stack_id()
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownError(format!("No stack id returned for {}", stack.name)));
    }

    async fn update_stack(&self, stack: &StackDescriptor) -> Result<String, Error> {
        let result = self
            .client
            .update_stack()
            .stack_name(&stack.name)
            .template_body(&stack.template_body)
            .set_parameters(Some(sdk_parameters(&stack.parameters)))
            .set_capabilities(Some(stack.capabilities.clone()))
            .send()
            .await
            .map_err(|error| service_error(error, UpdateStackError::message))?;

        return result
            .stack_id()
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownError(format!("No stack id returned for {}", stack.name)));
    }

    async fn stack_status(&self, stack_name: &str) -> Result<StackStatus, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|error| service_error(error, DescribeStacksError::message))?;

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        let stack = match stacks.first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(stack_name.to_string())),
        };

        return stack
            .stack_status()
            .cloned()
            .ok_or_else(|| Error::UnknownError(format!("Stack {} has no status", stack_name)));
    }
}

fn sdk_parameters(parameters: &[StackParameter]) -> Vec<Parameter> {
    parameters
        .iter()
        .map(|parameter| {
            Parameter::builder()
                .parameter_key(&parameter.key)
                .parameter_value(&parameter.value)
                .build()
        })
        .collect()
}

/// Keeps the provider's raw message for service errors so callers can match on it.
fn service_error<E>(error: SdkError<E>, message: fn(&E) -> Option<&str>) -> Error
where
    E: std::error::Error + 'static,
{
    match error {
        SdkError::ServiceError { err, .. } => match message(&err) {
            Some(message) => Error::ServiceError(message.to_string()),
            None => Error::ServiceError(err.to_string()),
        },
        error => Error::UnknownError(error.to_string()),
    }
}

fn existing_stack_statuses() -> Vec<StackStatus> {
    vec![
        StackStatus::CreateComplete,
        StackStatus::UpdateComplete,
        StackStatus::UpdateRollbackComplete,
    ]
}

/// Whether a live stack called `stack_name` exists, following every page of `ListStacks`.
pub async fn stack_exists<S>(service: &S, stack_name: &str) -> Result<bool, Error>
where
    S: StackService + ?Sized,
{
    let statuses = existing_stack_statuses();
    let mut next_token = None;

    loop {
        let page = service.list_stacks(&statuses, next_token).await?;
        for stack in &page.stacks {
            if stack.status == StackStatus::DeleteComplete {
                continue;
            }
            if stack.name == stack_name {
                return Ok(true);
            }
        }

        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => return Ok(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    CreateComplete,
    UpdateComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    Pending,
}

impl WaitCondition {
    fn evaluate(&self, status: &StackStatus) -> Verdict {
        match (self, status) {
            (WaitCondition::CreateComplete, StackStatus::CreateComplete) => Verdict::Success,
            (
                WaitCondition::CreateComplete,
                StackStatus::CreateFailed
                | StackStatus::DeleteComplete
                | StackStatus::DeleteFailed
                | StackStatus::RollbackFailed
                | StackStatus::RollbackComplete,
            ) => Verdict::Failure,
            (WaitCondition::UpdateComplete, StackStatus::UpdateComplete) => Verdict::Success,
            (
                WaitCondition::UpdateComplete,
                StackStatus::UpdateFailed
                | StackStatus::UpdateRollbackFailed
                | StackStatus::UpdateRollbackComplete,
            ) => Verdict::Failure,
            _ => Verdict::Pending,
        }
    }
}

/// How long and how often to poll a stack after create or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30 * 120),
        }
    }
}

/// Polls the stack until `condition` succeeds or fails, the timeout expires or
/// `cancellation` fires. Cancellation is only observed between polls.
pub async fn wait_for<S>(
    service: &S,
    stack_name: &str,
    condition: WaitCondition,
    config: &WaitConfig,
    cancellation: &Cancellation,
) -> Result<StackStatus, Error>
where
    S: StackService + ?Sized,
{
    let deadline = Instant::now() + config.timeout;

    loop {
        let status = service.stack_status(stack_name).await?;
        match condition.evaluate(&status) {
            Verdict::Success => return Ok(status),
            Verdict::Failure => {
                return Err(Error::WaitFailed {
                    stack_name: stack_name.to_string(),
                    status: status.as_str().to_string(),
                })
            }
            Verdict::Pending => debug!("Stack {} is {}", stack_name, status.as_str()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::TimedOut(stack_name.to_string()));
        }
        let pause = config.poll_interval.min(deadline - now);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancellation.cancelled() => {
                return Err(Error::Cancelled(stack_name.to_string()));
            }
        }
    }
}

/// Creates or updates one stack and blocks until CloudFormation settles it.
pub struct Deployer<'a, S: ?Sized> {
    service: &'a S,
    wait: WaitConfig,
    cancellation: Cancellation,
}

impl<'a, S> Deployer<'a, S>
where
    S: StackService + ?Sized,
{
    pub fn new(service: &'a S, wait: WaitConfig, cancellation: Cancellation) -> Self {
        Self {
            service,
            wait,
            cancellation,
        }
    }

    pub fn service(&self) -> &'a S {
        self.service
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn ensure_not_cancelled(&self, stack_name: &str) -> Result<(), Error> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled(stack_name.to_string()));
        }

        return Ok(());
    }

    /// Nothing is mutated once the cancellation has fired.
    pub async fn deploy(&self, stack: &StackDescriptor) -> Result<DeployOutcome, Error> {
        info!("Fetched parameters for {}", stack.name);
        for parameter in &stack.parameters {
            info!("\t{} :\t {}", parameter.key, parameter.value);
        }

        self.ensure_not_cancelled(&stack.name)?;
        let exists = stack_exists(self.service, &stack.name).await?;
        self.ensure_not_cancelled(&stack.name)?;

        let outcome = if exists {
            info!("Updating {}", stack.name);
            let stack_id = match self.service.update_stack(stack).await {
                Ok(stack_id) => stack_id,
                Err(Error::ServiceError(message)) if message == NO_UPDATES_MESSAGE => {
                    info!("No changes for {}", stack.name);
                    return Ok(DeployOutcome::Unchanged {
                        stack_name: stack.name.clone(),
                    });
                }
                Err(error) => return Err(error),
            };

            info!("...waiting for stack {} to be ready...", stack.name);
            wait_for(
                self.service,
                &stack.name,
                WaitCondition::UpdateComplete,
                &self.wait,
                &self.cancellation,
            )
            .await?;
            DeployOutcome::Updated { stack_id }
        } else {
            info!("Creating {}", stack.name);
            let stack_id = self.service.create_stack(stack).await?;

            info!("...waiting for stack {} to be ready...", stack.name);
            wait_for(
                self.service,
                &stack.name,
                WaitCondition::CreateComplete,
                &self.wait,
                &self.cancellation,
            )
            .await?;
            DeployOutcome::Created { stack_id }
        };

        match &outcome {
            DeployOutcome::Created { stack_id } | DeployOutcome::Updated { stack_id } => {
                info!("Stack is deployed! STACK ID : {}", stack_id)
            }
            DeployOutcome::Unchanged { .. } => {}
        }

        return Ok(outcome);
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aws_sdk_cloudformation::model::StackStatus;

    use super::testing::{Call, FakeStackService};
    use super::{
        stack_exists, wait_for, DeployOutcome, Deployer, Error, StackDescriptor, StackPage,
        StackSummary, WaitCondition, WaitConfig, NO_UPDATES_MESSAGE,
    };
    use crate::parameters::StackParameter;
    use crate::signal::Cancellation;

    fn fast_wait() -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn live_statuses() -> Vec<StackStatus> {
        vec![
            StackStatus::CreateComplete,
            StackStatus::UpdateComplete,
            StackStatus::UpdateRollbackComplete,
        ]
    }

    fn descriptor(name: &str) -> StackDescriptor {
        StackDescriptor::new(
            name.to_string(),
            String::from("Resources: {}"),
            vec![StackParameter::new("NamingSuffix", "x1")],
        )
    }

    #[tokio::test]
    async fn empty_stack_list_does_not_exist() {
        let service = FakeStackService::default();

        let exists = stack_exists(&service, "kf-artemis-s3-bucket-data-dev-x1").await;
        assert_eq!(Ok(false), exists);
    }

    #[tokio::test]
    async fn delete_complete_stacks_are_ignored() {
        let service = FakeStackService::with_stacks(&[
            ("kf-artemis-s3-bucket-data-dev-x1", StackStatus::DeleteComplete),
            ("other", StackStatus::DeleteComplete),
        ]);

        let exists = stack_exists(&service, "kf-artemis-s3-bucket-data-dev-x1").await;
        assert_eq!(Ok(false), exists);
    }

    #[tokio::test]
    async fn matching_live_stack_exists() {
        let service = FakeStackService::with_stacks(&[
            ("other", StackStatus::CreateComplete),
            ("kf-artemis-s3-bucket-data-dev-x1", StackStatus::UpdateRollbackComplete),
        ]);

        let exists = stack_exists(&service, "kf-artemis-s3-bucket-data-dev-x1").await;
        assert_eq!(Ok(true), exists);

        let exists = stack_exists(&service, "kf-artemis-s3-bucket-data-dev").await;
        assert_eq!(Ok(false), exists);
    }

    #[tokio::test]
    async fn follows_every_page() {
        let first = StackPage {
            stacks: vec![StackSummary {
                name: String::from("other"),
                status: StackStatus::CreateComplete,
            }],
            next_token: Some(String::from("1")),
        };
        let second = StackPage {
            stacks: vec![StackSummary {
                name: String::from("target"),
                status: StackStatus::UpdateComplete,
            }],
            next_token: None,
        };
        let service = FakeStackService {
            pages: vec![first, second],
            ..Default::default()
        };

        assert_eq!(Ok(true), stack_exists(&service, "target").await);
        assert_eq!(
            vec![
                Call::ListStacks(live_statuses(), None),
                Call::ListStacks(live_statuses(), Some(String::from("1"))),
            ],
            service.calls()
        );
    }

    #[tokio::test]
    async fn absent_stack_is_created() {
        let service = FakeStackService::default();
        let deployer = Deployer::new(&service, fast_wait(), Cancellation::never());

        let outcome = deployer.deploy(&descriptor("stack")).await.unwrap();
        assert_eq!(
            DeployOutcome::Created {
                stack_id: String::from("arn:aws:cloudformation:stack/stack/new")
            },
            outcome
        );
        assert_eq!(
            vec![
                Call::ListStacks(live_statuses(), None),
                Call::CreateStack(String::from("stack")),
                Call::StackStatus(String::from("stack")),
            ],
            service.calls()
        );
    }

    #[tokio::test]
    async fn existing_stack_is_updated_and_waited_on() {
        let service = FakeStackService::with_stacks(&[("stack", StackStatus::CreateComplete)]);
        service.queue_statuses(vec![
            Ok(StackStatus::UpdateInProgress),
            Ok(StackStatus::UpdateCompleteCleanupInProgress),
            Ok(StackStatus::UpdateComplete),
        ]);
        let deployer = Deployer::new(&service, fast_wait(), Cancellation::never());

        let outcome = deployer.deploy(&descriptor("stack")).await.unwrap();
        assert_eq!(
            DeployOutcome::Updated {
                stack_id: String::from("arn:aws:cloudformation:stack/stack/existing")
            },
            outcome
        );

        let calls = service.calls();
        assert_eq!(Call::UpdateStack(String::from("stack")), calls[1]);
        assert_eq!(3, calls.iter().filter(|call| matches!(call, Call::StackStatus(_))).count());
        assert!(!calls.contains(&Call::CreateStack(String::from("stack"))));
    }

    #[tokio::test]
    async fn no_updates_is_a_successful_noop() {
        let service = FakeStackService {
            update_error: Some(Error::ServiceError(String::from(NO_UPDATES_MESSAGE))),
            ..FakeStackService::with_stacks(&[("stack", StackStatus::UpdateComplete)])
        };
        let deployer = Deployer::new(&service, fast_wait(), Cancellation::never());

        let outcome = deployer.deploy(&descriptor("stack")).await.unwrap();
        assert_eq!(
            DeployOutcome::Unchanged {
                stack_name: String::from("stack")
            },
            outcome
        );
        assert!(!service
            .calls()
            .iter()
            .any(|call| matches!(call, Call::StackStatus(_))));
    }

    #[tokio::test]
    async fn cancelled_deploy_mutates_nothing() {
        let service = FakeStackService::with_stacks(&[("stack", StackStatus::CreateComplete)]);
        let (handle, cancellation) = Cancellation::new();
        handle.cancel();
        let deployer = Deployer::new(&service, fast_wait(), cancellation);

        assert_eq!(
            Err(Error::Cancelled(String::from("stack"))),
            deployer.deploy(&descriptor("stack")).await
        );
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn other_update_failures_propagate() {
        let error = Error::ServiceError(String::from("Stack is in UPDATE_IN_PROGRESS state"));
        let service = FakeStackService {
            update_error: Some(error.clone()),
            ..FakeStackService::with_stacks(&[("stack", StackStatus::UpdateComplete)])
        };
        let deployer = Deployer::new(&service, fast_wait(), Cancellation::never());

        assert_eq!(Err(error), deployer.deploy(&descriptor("stack")).await);
    }

    #[tokio::test]
    async fn create_failures_propagate() {
        let error = Error::ServiceError(String::from("Requires capabilities"));
        let service = FakeStackService {
            create_error: Some(error.clone()),
            ..Default::default()
        };
        let deployer = Deployer::new(&service, fast_wait(), Cancellation::never());

        assert_eq!(Err(error), deployer.deploy(&descriptor("stack")).await);
    }

    #[tokio::test]
    async fn rollback_fails_the_create_wait() {
        let service = FakeStackService::default();
        service.queue_statuses(vec![
            Ok(StackStatus::CreateInProgress),
            Ok(StackStatus::RollbackInProgress),
            Ok(StackStatus::RollbackComplete),
        ]);

        let result = wait_for(
            &service,
            "stack",
            WaitCondition::CreateComplete,
            &fast_wait(),
            &Cancellation::never(),
        )
        .await;
        assert_eq!(
            Err(Error::WaitFailed {
                stack_name: String::from("stack"),
                status: String::from("ROLLBACK_COMPLETE"),
            }),
            result
        );
    }

    #[tokio::test]
    async fn update_rollback_fails_the_update_wait() {
        let service = FakeStackService::default();
        service.queue_statuses(vec![Ok(StackStatus::UpdateRollbackComplete)]);

        let result = wait_for(
            &service,
            "stack",
            WaitCondition::UpdateComplete,
            &fast_wait(),
            &Cancellation::never(),
        )
        .await;
        match result {
            Err(Error::WaitFailed { status, .. }) => {
                assert_eq!("UPDATE_ROLLBACK_COMPLETE", status)
            }
            other => panic!("Expected `WaitFailed` error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn describe_errors_fail_the_wait() {
        let service = FakeStackService::default();
        let error = Error::ServiceError(String::from("Stack with id stack does not exist"));
        service.queue_statuses(vec![Err(error.clone())]);

        let result = wait_for(
            &service,
            "stack",
            WaitCondition::CreateComplete,
            &fast_wait(),
            &Cancellation::never(),
        )
        .await;
        assert_eq!(Err(error), result);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let service = FakeStackService::default();
        service.queue_statuses(
            (0..1000)
                .map(|_| Ok(StackStatus::CreateInProgress))
                .collect(),
        );
        let config = WaitConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(20),
        };

        let result = wait_for(
            &service,
            "stack",
            WaitCondition::CreateComplete,
            &config,
            &Cancellation::never(),
        )
        .await;
        assert_eq!(Err(Error::TimedOut(String::from("stack"))), result);
    }

    #[tokio::test]
    async fn wait_is_cancelled_between_polls() {
        let service = FakeStackService::default();
        service.queue_statuses(vec![Ok(StackStatus::CreateInProgress)]);
        let (handle, cancellation) = Cancellation::new();
        handle.cancel();
        let config = WaitConfig {
            poll_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(600),
        };

        let result = wait_for(
            &service,
            "stack",
            WaitCondition::CreateComplete,
            &config,
            &cancellation,
        )
        .await;
        assert_eq!(Err(Error::Cancelled(String::from("stack"))), result);
        assert_eq!(1, service.calls().len());
    }
}
