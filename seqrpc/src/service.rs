use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use crate::codec::CodecType;
use crate::error::{Error, ErrorKind, Result};

type HandlerFunc = Box<dyn Fn(CodecType, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// One registered method: a type-erased handler plus its call counter.
///
/// The handler decodes the argument value with the connection's codec,
/// awaits the user future, and encodes the reply the same way.
pub struct Method {
    handler: HandlerFunc,
    num_calls: AtomicU64,
}

impl Method {
    pub(crate) fn invoke(&self, kind: CodecType, body: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, body)
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named bundle of methods, built at registration time.
///
/// The service name plays the role of a type name and must begin with an
/// uppercase letter. Handler shapes are enforced by `register_method`'s
/// bounds: one deserializable argument in, one serializable reply out,
/// failures reported through [`Error`].
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>, RandomState>,
}

impl Service {
    /// # Errors
    ///
    /// Rejects names that do not begin with an uppercase letter.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.chars().next().is_some_and(char::is_uppercase) {
            return Err(Error::new(
                ErrorKind::InvalidServiceName,
                format!("rpc server: {name} is not a valid service name"),
            ));
        }
        Ok(Self {
            name,
            methods: HashMap::default(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    /// Registers a handler under `name`.
    ///
    /// # Errors
    ///
    /// Registering the same method name twice is an error.
    pub fn register_method<A, R, F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<&mut Self>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        if self.methods.contains_key(&name) {
            return Err(Error::new(
                ErrorKind::DuplicateMethod,
                format!("rpc: method already defined: {}.{name}", self.name),
            ));
        }
        let func: HandlerFunc = Box::new(move |kind: CodecType, body: Bytes| -> BoxFuture<'static, Result<Bytes>> {
            match kind.decode::<A>(&body) {
                Ok(args) => {
                    let fut = handler(args);
                    Box::pin(async move {
                        let reply = fut.await?;
                        kind.encode(&reply)
                    })
                }
                Err(e) => Box::pin(std::future::ready(Err(e))),
            }
        });
        self.methods.insert(
            name,
            Arc::new(Method {
                handler: func,
                num_calls: AtomicU64::new(0),
            }),
        );
        Ok(self)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    fn sum_service() -> Service {
        let mut service = Service::new("Foo").unwrap();
        service
            .register_method("Sum", |args: SumArgs| async move {
                Ok(args.num1 + args.num2)
            })
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_invoke_counts_calls() {
        let service = sum_service();
        let method = service.method("Sum").unwrap().clone();
        assert_eq!(method.num_calls(), 0);

        let kind = CodecType::Msgpack;
        let body = kind.encode(&SumArgs { num1: 1, num2: 3 }).unwrap();
        let reply = method.invoke(kind, body).await.unwrap();
        let sum: i64 = kind.decode(&reply).unwrap();
        assert_eq!(sum, 4);
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_invoke_rejects_bad_body() {
        let service = sum_service();
        let method = service.method("Sum").unwrap().clone();
        let err = method
            .invoke(CodecType::Msgpack, Bytes::from_static(b"\xff\xff"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
        // a failed decode still counts as an invocation
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_container_replies() {
        let mut service = Service::new("Foo").unwrap();
        service
            .register_method("SumMap", |args: SumArgs| async move {
                let mut reply = HashMap::<String, i64>::new();
                reply.insert("result".to_string(), args.num1 + args.num2);
                Ok(reply)
            })
            .unwrap()
            .register_method("SumVec", |args: SumArgs| async move {
                Ok(vec![args.num1 + args.num2])
            })
            .unwrap();

        let kind = CodecType::Json;
        let body = kind.encode(&SumArgs { num1: 2, num2: 5 }).unwrap();
        let reply = service
            .method("SumMap")
            .unwrap()
            .invoke(kind, body.clone())
            .await
            .unwrap();
        let map: HashMap<String, i64> = kind.decode(&reply).unwrap();
        assert_eq!(map["result"], 7);

        let reply = service
            .method("SumVec")
            .unwrap()
            .invoke(kind, body)
            .await
            .unwrap();
        let vec: Vec<i64> = kind.decode(&reply).unwrap();
        assert_eq!(vec, [7]);
    }

    #[test]
    fn test_invalid_service_name() {
        let err = Service::new("foo").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidServiceName);
        let err = Service::new("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidServiceName);
    }

    #[test]
    fn test_duplicate_method() {
        let mut service = sum_service();
        let err = service
            .register_method("Sum", |args: SumArgs| async move {
                Ok(args.num1 + args.num2)
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateMethod);
    }
}
