mod adapter;

use ironposh_pool_core::PoolConfig;

use crate::{
    RunspacePool,
    testing::{MockFactory, ScriptStep},
};

fn config(max_size: usize) -> PoolConfig {
    PoolConfig::builder().max_size(max_size).build()
}

fn mock_pool(max_size: usize, script: Vec<ScriptStep>) -> (RunspacePool<MockFactory>, MockFactory) {
    let factory = MockFactory::new().with_script(script);
    let pool = RunspacePool::new(factory.clone(), config(max_size)).unwrap();
    (pool, factory)
}
