//! # Call Proxy
//!
//! Path-building front end over [`Client`]: segments are accumulated one at a
//! time and a terminal verb decides what kind of call is made.
//!
//! ```ignore
//! let user = client.rpc().at("users").at("get").query(json!({"id": 7})).await?;
//! let updates = client.rpc().at("users").at("changes").subscribe_stream(())?;
//! let same = client.invoke(&["users", "get", "query"], json!({"id": 7})).await?;
//! ```
//!
//! Verbs map onto route kinds: `query` → query, `mutate` → mutation,
//! `subscribe` → subscription.

use std::fmt;
use std::str::FromStr;

use duplexrpc::RouteType;
use serde::Serialize;
use serde_json::Value;

use crate::client::Client;
use crate::client::Error;
use crate::client::Result;
use crate::client::SubscriptionHandle;
use crate::client::SubscriptionOptions;
use crate::client::SubscriptionStream;
use crate::client::to_input;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Query,
    Mutate,
    Subscribe,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutate => "mutate",
            Self::Subscribe => "subscribe",
        }
    }

    pub fn route_type(&self) -> RouteType {
        match self {
            Self::Query => RouteType::Query,
            Self::Mutate => RouteType::Mutation,
            Self::Subscribe => RouteType::Subscription,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(Self::Query),
            "mutate" => Ok(Self::Mutate),
            "subscribe" => Ok(Self::Subscribe),
            other => Err(Error::InvalidVerb(other.to_owned())),
        }
    }
}

/// A route path under construction.
#[derive(Clone)]
pub struct RoutePath<'a> {
    client: &'a Client,
    path: Vec<String>,
}

impl<'a> RoutePath<'a> {
    pub fn at(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub async fn query(self, input: impl Serialize) -> Result<Value> {
        self.client.request(self.path, RouteType::Query, to_input(input)?).await
    }

    pub async fn mutate(self, input: impl Serialize) -> Result<Value> {
        self.client.request(self.path, RouteType::Mutation, to_input(input)?).await
    }

    pub fn subscribe(self, input: impl Serialize, options: SubscriptionOptions) -> Result<SubscriptionHandle> {
        self.client.start_subscription(self.path, to_input(input)?, options)
    }

    pub fn subscribe_stream(self, input: impl Serialize) -> Result<SubscriptionStream> {
        self.client.start_stream(self.path, to_input(input)?)
    }
}

impl fmt::Debug for RoutePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RoutePath").field(&self.path.join("/")).finish()
    }
}

/// Result of [`Client::invoke`].
#[derive(Debug)]
pub enum Invocation {
    Data(Value),
    Subscription(SubscriptionStream),
}

impl Client {
    /// Starts an empty route path.
    pub fn rpc(&self) -> RoutePath<'_> {
        RoutePath { client: self, path: Vec::new() }
    }

    /// Calls `path_with_verb[..n-1]` using the verb named by the last segment.
    pub async fn invoke(&self, path_with_verb: &[&str], input: Value) -> Result<Invocation> {
        let Some((verb, segments)) = path_with_verb.split_last() else {
            return Err(Error::InvalidVerb(String::new()));
        };

        let path = segments
            .iter()
            .fold(self.rpc(), |path, segment| path.at(*segment));

        match verb.parse::<Verb>()? {
            Verb::Query => path.query(input).await.map(Invocation::Data),
            Verb::Mutate => path.mutate(input).await.map(Invocation::Data),
            Verb::Subscribe => path.subscribe_stream(input).map(Invocation::Subscription),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbs_parse() {
        assert_eq!("query".parse::<Verb>().unwrap(), Verb::Query);
        assert_eq!("mutate".parse::<Verb>().unwrap().route_type(), RouteType::Mutation);
        assert_eq!("subscribe".parse::<Verb>().unwrap().route_type(), RouteType::Subscription);
    }

    #[test]
    fn test_unknown_verb_message() {
        let err = "mutation".parse::<Verb>().unwrap_err();
        assert_eq!(err, Error::InvalidVerb("mutation".into()));
        assert_eq!(
            err.to_string(),
            "Invalid route verb \"mutation\", should be one of query, mutate, subscribe"
        );
    }
}
