mod coordinator;
mod ledger;
mod providers;
