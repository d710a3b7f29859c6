//! Blog post domain shared by the integration tests.

#![allow(dead_code)]

use chronicle::{
    Aggregate, Apply, BusinessRule, DomainEvent, Handle, Parameters, RuleViolation, check_rule,
    typed_id,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

typed_id! {
    /// Identifies a blog post.
    pub struct PostId(uuid::Uuid);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
pub struct PostDrafted {
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
pub struct PostRetitled {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
#[event(kind = "post-published.v1")]
pub struct PostPublished;

#[derive(Debug, Error)]
pub enum PostError {
    #[error(transparent)]
    Rule(#[from] RuleViolation),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, Aggregate)]
#[aggregate(
    id = PostId,
    error = PostError,
    events(PostDrafted, PostRetitled, PostPublished),
    derives(Debug, PartialEq, Eq)
)]
pub struct Post {
    pub title: String,
    pub author: String,
    pub published: bool,
    pub revisions: u32,
}

impl Apply<PostDrafted> for Post {
    fn apply(&mut self, event: &PostDrafted) {
        self.title.clone_from(&event.title);
        self.author.clone_from(&event.author);
    }
}

impl Apply<PostRetitled> for Post {
    fn apply(&mut self, event: &PostRetitled) {
        self.title.clone_from(&event.title);
        self.revisions += 1;
    }
}

impl Apply<PostPublished> for Post {
    fn apply(&mut self, _: &PostPublished) {
        self.published = true;
    }
}

pub struct TitleNotBlank<'a>(pub &'a str);

impl BusinessRule for TitleNotBlank<'_> {
    fn is_broken(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn message(&self) -> String {
        "title must not be blank".to_string()
    }

    fn describe(&self, parameters: &mut Parameters) {
        parameters.insert("title".to_string(), self.0.into());
    }
}

pub struct NotYetPublished(pub bool);

impl BusinessRule for NotYetPublished {
    fn is_broken(&self) -> bool {
        self.0
    }

    fn message(&self) -> String {
        "post is already published".to_string()
    }

    fn name(&self) -> &'static str {
        "not-yet-published"
    }
}

pub struct Draft {
    pub title: String,
    pub author: String,
}

impl Handle<Draft> for Post {
    fn handle(&self, command: &Draft) -> Result<Vec<Self::Event>, Self::Error> {
        check_rule(&TitleNotBlank(&command.title))?;
        Ok(vec![
            PostDrafted {
                title: command.title.clone(),
                author: command.author.clone(),
            }
            .into(),
        ])
    }
}

pub struct Retitle(pub String);

impl Handle<Retitle> for Post {
    fn handle(&self, command: &Retitle) -> Result<Vec<Self::Event>, Self::Error> {
        check_rule(&TitleNotBlank(&command.0))?;
        check_rule(&NotYetPublished(self.published))?;
        Ok(vec![PostRetitled { title: command.0.clone() }.into()])
    }
}

pub struct Publish;

impl Handle<Publish> for Post {
    fn handle(&self, _: &Publish) -> Result<Vec<Self::Event>, Self::Error> {
        check_rule(&NotYetPublished(self.published))?;
        Ok(vec![PostPublished.into()])
    }
}

pub fn draft(title: &str) -> Draft {
    Draft {
        title: title.to_string(),
        author: "ada".to_string(),
    }
}

/// Route library logs to the test harness's captured output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
