mod fixtures;

mod budget_tests;
mod context_tests;
